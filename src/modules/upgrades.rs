use std::path::PathBuf;

use crate::core::error::{HardnError, HardnResult};
use crate::core::plan::HardeningPlan;
use crate::core::platform::PlatformInfo;
use crate::core::status::TriState;
use crate::engine::executor::package_installed;
use crate::engine::framework::{
    Concern, ConcernModule, ModuleState, Step, ToolState,
};
use crate::execution::context::{ExecutionContext, Owner};
use crate::execution::mutator::MODE_CONFIG;
use crate::execution::service::SVC_UNATTENDED_UPGRADES;

pub const AUTO_UPGRADES_CONF: &str = "/etc/apt/apt.conf.d/20auto-upgrades";

const AUTO_UPGRADES_CONTENT: &str = "APT::Periodic::Update-Package-Lists \"1\";\n\
APT::Periodic::Unattended-Upgrade \"1\";";

/// Automatic security updates via unattended-upgrades. apt-only; Alpine
/// records a clean Unsupported.
pub struct UpgradesModule;

impl ConcernModule for UpgradesModule {
    fn concern(&self) -> Concern {
        Concern::Upgrades
    }

    fn audit(
        &self,
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
    ) -> HardnResult<ModuleState> {
        if !platform.family.is_debian_like() {
            return Ok(ModuleState::Unsupported);
        }
        let installed = package_installed(ctx, platform, "unattended-upgrades");
        let status = ctx.query_service(SVC_UNATTENDED_UPGRADES);
        Ok(ModuleState::Tool(ToolState {
            installed,
            active: if installed {
                TriState::from_bool(status.active)
            } else {
                TriState::Off
            },
            enabled: TriState::from_bool(status.enabled),
        }))
    }

    fn plan(
        &self,
        _ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
        plan: &HardeningPlan,
        state: &ModuleState,
    ) -> HardnResult<Vec<Step>> {
        let Some(upgrades) = &plan.upgrades else {
            return Ok(Vec::new());
        };
        if !upgrades.enable {
            return Ok(Vec::new());
        }
        if matches!(state, ModuleState::Unsupported) {
            return Err(HardnError::UnsupportedPlatform {
                family: platform.family,
                concern: Concern::Upgrades,
            });
        }

        Ok(vec![
            Step::InstallPackage {
                name: "unattended-upgrades".to_string(),
            },
            Step::WriteManaged {
                path: PathBuf::from(AUTO_UPGRADES_CONF),
                content: AUTO_UPGRADES_CONTENT.to_string(),
                mode: MODE_CONFIG,
                owner: Owner::Root,
                destructive_symlink: false,
            },
            Step::Service {
                logical: SVC_UNATTENDED_UPGRADES.to_string(),
                active: Some(true),
                enabled: Some(true),
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::UpgradesPlan;
    use crate::core::platform::{Family, InitSystem};
    use crate::engine::framework::SkipReason;
    use crate::execution::memory::MemoryContext;

    fn debian() -> PlatformInfo {
        PlatformInfo {
            family: Family::Debian,
            version: "12".into(),
            codename: "bookworm".into(),
            kernel: "6.1.0-test".into(),
            init: InitSystem::Systemd,
        }
    }

    fn alpine() -> PlatformInfo {
        PlatformInfo {
            family: Family::Alpine,
            version: "3.19".into(),
            codename: String::new(),
            kernel: "6.6.0-test".into(),
            init: InitSystem::OpenRc,
        }
    }

    fn upgrades_plan() -> HardeningPlan {
        HardeningPlan {
            upgrades: Some(UpgradesPlan { enable: true }),
            ..Default::default()
        }
    }

    #[test]
    fn debian_installs_configures_and_enables() {
        let mut ctx = MemoryContext::new();
        let module = UpgradesModule;
        let platform = debian();
        let plan = upgrades_plan();

        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();
        let result = module.apply(&mut ctx, &platform, steps);

        assert!(result.ok(), "errors: {:?}", result.errors);
        assert!(ctx.package_installed("unattended-upgrades"));
        let conf = ctx.file_string(AUTO_UPGRADES_CONF).unwrap();
        assert!(conf.contains("APT::Periodic::Update-Package-Lists \"1\";"));
        assert!(conf.contains("APT::Periodic::Unattended-Upgrade \"1\";"));
        let status = ctx.query_service("unattended-upgrades");
        assert!(status.active && status.enabled);
    }

    #[test]
    fn alpine_is_unsupported_without_mutations() {
        let mut ctx = MemoryContext::new();
        let module = UpgradesModule;
        let platform = alpine();
        let plan = upgrades_plan();

        let state = module.audit(&mut ctx, &platform).unwrap();
        assert!(matches!(state, ModuleState::Unsupported));
        match module.plan(&mut ctx, &platform, &plan, &state) {
            Err(HardnError::UnsupportedPlatform { family, concern }) => {
                assert_eq!(family, Family::Alpine);
                assert_eq!(concern, Concern::Upgrades);
            }
            other => panic!("expected UnsupportedPlatform, got {other:?}"),
        }
        assert!(ctx.mutating_commands_run().is_empty());
    }

    #[test]
    fn replay_skips_every_step() {
        let mut ctx = MemoryContext::new();
        let module = UpgradesModule;
        let platform = debian();
        let plan = upgrades_plan();

        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();
        module.apply(&mut ctx, &platform, steps);

        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();
        let result = module.apply(&mut ctx, &platform, steps);

        assert!(result.performed.is_empty());
        assert!(result
            .skipped
            .iter()
            .all(|(_, r)| *r == SkipReason::AlreadyInDesiredState));
    }
}
