use crate::core::error::{HardnError, HardnResult};
use crate::core::plan::HardeningPlan;
use crate::core::platform::PlatformInfo;
use crate::core::status::TriState;
use crate::engine::executor::package_installed;
use crate::engine::framework::{
    Concern, ConcernModule, ModuleState, Step, ToolState,
};
use crate::execution::context::ExecutionContext;
use crate::execution::service::SVC_APPARMOR;

/// Mandatory access control via AppArmor. Debian-family only; the audit
/// trusts `aa-status` over the unit state because a loaded service with an
/// unloaded securityfs still confines nothing.
pub struct ApparmorModule;

impl ConcernModule for ApparmorModule {
    fn concern(&self) -> Concern {
        Concern::AppArmor
    }

    fn audit(
        &self,
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
    ) -> HardnResult<ModuleState> {
        if !platform.family.is_debian_like() {
            return Ok(ModuleState::Unsupported);
        }
        let installed = package_installed(ctx, platform, "apparmor");
        let status = ctx.query_service(SVC_APPARMOR);
        let active = if !installed {
            TriState::Off
        } else {
            match ctx.run_query(&["aa-status", "--enabled"]) {
                Ok(out) => TriState::from_bool(out.success()),
                Err(_) => TriState::Unknown,
            }
        };
        Ok(ModuleState::Tool(ToolState {
            installed,
            active,
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
        let Some(apparmor) = &plan.apparmor else {
            return Ok(Vec::new());
        };
        if !apparmor.enable {
            return Ok(Vec::new());
        }
        if matches!(state, ModuleState::Unsupported) {
            return Err(HardnError::UnsupportedPlatform {
                family: platform.family,
                concern: Concern::AppArmor,
            });
        }

        Ok(vec![
            Step::InstallPackage {
                name: "apparmor".to_string(),
            },
            Step::InstallPackage {
                name: "apparmor-utils".to_string(),
            },
            Step::Service {
                logical: SVC_APPARMOR.to_string(),
                active: Some(true),
                enabled: Some(true),
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::ApparmorPlan;
    use crate::core::platform::{Family, InitSystem};
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

    #[test]
    fn installs_both_packages_and_enables_service() {
        let mut ctx = MemoryContext::new();
        let module = ApparmorModule;
        let platform = debian();
        let plan = HardeningPlan {
            apparmor: Some(ApparmorPlan { enable: true }),
            ..Default::default()
        };

        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();
        let result = module.apply(&mut ctx, &platform, steps);

        assert!(result.ok(), "errors: {:?}", result.errors);
        assert!(ctx.package_installed("apparmor"));
        assert!(ctx.package_installed("apparmor-utils"));
        let status = ctx.query_service("apparmor");
        assert!(status.active && status.enabled);
    }

    #[test]
    fn audit_uses_aa_status_for_the_active_bit() {
        let mut ctx = MemoryContext::new();
        ctx.seed_package("apparmor");
        ctx.seed_service("apparmor", true, true, true);
        ctx.script_command(&["aa-status", "--enabled"], 1, "", "apparmor module is not loaded");

        let module = ApparmorModule;
        let state = module.audit(&mut ctx, &debian()).unwrap();
        let ModuleState::Tool(tool) = state else { panic!() };
        assert!(tool.installed);
        // Unit says active, kernel says no: aa-status wins.
        assert_eq!(tool.active, TriState::Off);
    }

    #[test]
    fn alpine_is_unsupported() {
        let mut ctx = MemoryContext::new();
        let module = ApparmorModule;
        let plan = HardeningPlan {
            apparmor: Some(ApparmorPlan { enable: true }),
            ..Default::default()
        };

        let state = module.audit(&mut ctx, &alpine()).unwrap();
        match module.plan(&mut ctx, &alpine(), &plan, &state) {
            Err(HardnError::UnsupportedPlatform { concern, .. }) => {
                assert_eq!(concern, Concern::AppArmor);
            }
            other => panic!("expected UnsupportedPlatform, got {other:?}"),
        }
    }
}
