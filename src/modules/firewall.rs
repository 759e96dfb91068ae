use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::error::{HardnError, HardnResult};
use crate::core::plan::{AppProfile, HardeningPlan};
use crate::core::platform::{Family, PlatformInfo};
use crate::core::status::TriState;
use crate::engine::executor::package_installed;
use crate::engine::framework::{
    Concern, ConcernModule, FirewallState, ModuleState, Probe, Step,
};
use crate::execution::context::{ExecutionContext, Owner};
use crate::execution::mutator::MODE_CONFIG;

pub const APP_PROFILE_DIR: &str = "/etc/ufw/applications.d";
pub const APP_PROFILE_PATH: &str = "/etc/ufw/applications.d/hardn";

static RULE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+)\s+ALLOW").expect("rule regex"));

/// UFW-backed inbound firewall. Debian-family hosts always qualify; Alpine
/// only when the ufw package is actually present.
pub struct FirewallModule;

impl FirewallModule {
    fn ufw_present(ctx: &mut dyn ExecutionContext, platform: &PlatformInfo) -> bool {
        package_installed(ctx, platform, "ufw")
            || ctx.stat(Path::new("/usr/sbin/ufw")).is_some()
            || ctx.stat(Path::new("/usr/bin/ufw")).is_some()
    }

    fn available(ctx: &mut dyn ExecutionContext, platform: &PlatformInfo) -> bool {
        platform.family.is_debian_like() || Self::ufw_present(ctx, platform)
    }

    /// Render the application profile file: one INI section per profile.
    fn render_profiles(profiles: &[AppProfile]) -> String {
        let mut out = String::new();
        for profile in profiles {
            out.push_str(&format!(
                "[{}]\ntitle={}\ndescription={}\nports={}\n",
                profile.name, profile.title, profile.desc, profile.ports
            ));
        }
        out
    }

    /// Whether the installed ufw understands `--force`. Versions that fail
    /// to report themselves get the stdin-confirmation fallback.
    fn force_enable_supported(ctx: &mut dyn ExecutionContext) -> bool {
        ctx.run_query(&["ufw", "--version"])
            .ok()
            .filter(|o| o.success())
            .is_some_and(|o| o.stdout.starts_with("ufw "))
    }
}

impl ConcernModule for FirewallModule {
    fn concern(&self) -> Concern {
        Concern::Firewall
    }

    fn audit(
        &self,
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
    ) -> HardnResult<ModuleState> {
        let available = Self::available(ctx, platform);
        let installed = Self::ufw_present(ctx, platform);
        let mut state = FirewallState {
            available,
            installed,
            ..Default::default()
        };

        if installed {
            match ctx.run_query(&["ufw", "status", "verbose"]) {
                Ok(out) if out.success() => {
                    state.active = TriState::from_bool(out.stdout.contains("Status: active"));
                    state.default_deny =
                        TriState::from_bool(out.stdout.contains("deny (incoming)"));
                    for line in out.stdout.lines() {
                        if let Some(captures) = RULE_LINE.captures(line.trim()) {
                            state.rules.push(captures[1].to_string());
                        }
                    }
                }
                _ => {
                    state.active = TriState::Unknown;
                    state.default_deny = TriState::Unknown;
                }
            }
        } else {
            // Not installed: inactive by definition, configuration unknown.
            state.active = TriState::Off;
            state.default_deny = TriState::Unknown;
        }

        Ok(ModuleState::Firewall(state))
    }

    fn plan(
        &self,
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
        plan: &HardeningPlan,
        state: &ModuleState,
    ) -> HardnResult<Vec<Step>> {
        let Some(firewall) = &plan.firewall else {
            return Ok(Vec::new());
        };
        if !firewall.enable {
            return Ok(Vec::new());
        }
        let ModuleState::Firewall(current) = state else {
            return Ok(Vec::new());
        };
        if !current.available {
            return Err(HardnError::UnsupportedPlatform {
                family: platform.family,
                concern: Concern::Firewall,
            });
        }

        let mut steps = Vec::new();

        if !current.installed {
            steps.push(Step::InstallPackage {
                name: "ufw".to_string(),
            });
        }

        if !firewall.app_profiles.is_empty() {
            // Some Alpine ufw builds ship without applications.d; create it.
            steps.push(Step::EnsureDir {
                path: PathBuf::from(APP_PROFILE_DIR),
                mode: 0o755,
                owner: Owner::Root,
            });
            steps.push(Step::WriteManaged {
                path: PathBuf::from(APP_PROFILE_PATH),
                content: Self::render_profiles(&firewall.app_profiles),
                mode: MODE_CONFIG,
                owner: Owner::Root,
                destructive_symlink: false,
            });
        }

        steps.push(Step::Command {
            argv: vec!["ufw".into(), "default".into(), "deny".into(), "incoming".into()],
            stdin: None,
            timeout: None,
            done: Some(Probe::FirewallDefaultDeny),
            fatal: false,
            only_if_changed: false,
        });
        steps.push(Step::Command {
            argv: vec!["ufw".into(), "default".into(), "allow".into(), "outgoing".into()],
            stdin: None,
            timeout: None,
            done: Some(Probe::FirewallOutboundAllow),
            fatal: false,
            only_if_changed: false,
        });

        // The SSH allowance is injected from the effective plan port and
        // always precedes enable, whatever order the operator listed rules.
        let ssh_rule = format!("{}/tcp", plan.ssh_port());
        steps.push(Step::Command {
            argv: vec!["ufw".into(), "allow".into(), ssh_rule.clone()],
            stdin: None,
            timeout: None,
            done: Some(Probe::FirewallRuleExists(ssh_rule.clone())),
            fatal: false,
            only_if_changed: false,
        });

        for rule in &firewall.allowed_extra_ports {
            let spec = rule.to_string();
            if spec == ssh_rule {
                continue;
            }
            steps.push(Step::Command {
                argv: vec!["ufw".into(), "allow".into(), spec.clone()],
                stdin: None,
                timeout: None,
                done: Some(Probe::FirewallRuleExists(spec)),
                fatal: false,
                only_if_changed: false,
            });
        }

        if Self::force_enable_supported(ctx) {
            steps.push(Step::Command {
                argv: vec!["ufw".into(), "--force".into(), "enable".into()],
                stdin: None,
                timeout: None,
                done: Some(Probe::FirewallActive),
                fatal: true,
                only_if_changed: false,
            });
        } else {
            // No --force on this build: feed the confirmation prompt on
            // stdin instead. Never via a shell.
            steps.push(Step::Command {
                argv: vec!["ufw".into(), "enable".into()],
                stdin: Some(b"y\n".to_vec()),
                timeout: None,
                done: Some(Probe::FirewallActive),
                fatal: true,
                only_if_changed: false,
            });
        }

        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::{FirewallPlan, PortRule, SshPlan};
    use crate::core::platform::InitSystem;
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

    fn firewall_plan() -> HardeningPlan {
        HardeningPlan {
            ssh: Some(SshPlan {
                port: Some(2222),
                ..Default::default()
            }),
            firewall: Some(FirewallPlan {
                enable: true,
                allowed_extra_ports: vec![PortRule {
                    port: 8080,
                    proto: "tcp".into(),
                }],
                app_profiles: vec![AppProfile {
                    name: "HardnWeb".into(),
                    title: "Web server".into(),
                    desc: "HTTP and HTTPS".into(),
                    ports: "80/tcp|443/tcp".into(),
                }],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn ssh_port_is_allowed_before_enable() {
        let mut ctx = MemoryContext::new();
        ctx.seed_package("ufw");

        let module = FirewallModule;
        let platform = debian();
        let plan = firewall_plan();
        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();

        let position = |needle: &str| {
            steps
                .iter()
                .position(|s| matches!(s, Step::Command { argv, .. } if argv.join(" ").contains(needle)))
                .unwrap_or_else(|| panic!("step {needle} missing"))
        };
        assert!(position("allow 2222/tcp") < position("enable"));
    }

    #[test]
    fn apply_activates_ufw_with_rules() {
        let mut ctx = MemoryContext::new();
        ctx.seed_package("ufw");

        let module = FirewallModule;
        let platform = debian();
        let plan = firewall_plan();
        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();
        let result = module.apply(&mut ctx, &platform, steps);

        assert!(result.ok(), "errors: {:?}", result.errors);
        assert!(ctx.ufw_is_active());
        assert!(ctx.ufw_rule_list().contains(&"2222/tcp".to_string()));
        assert!(ctx.ufw_rule_list().contains(&"8080/tcp".to_string()));
        let profiles = ctx.file_string(APP_PROFILE_PATH).unwrap();
        assert!(profiles.contains("[HardnWeb]"));
        assert!(profiles.contains("ports=80/tcp|443/tcp"));
    }

    #[test]
    fn post_state_always_allows_the_ssh_port() {
        // Whatever rule order the operator wrote, an active firewall must
        // carry the SSH allowance in its post-audit rule list.
        let mut ctx = MemoryContext::new();
        ctx.seed_package("ufw");

        let module = FirewallModule;
        let platform = debian();
        let plan = firewall_plan();
        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();
        module.apply(&mut ctx, &platform, steps);

        let state = module.audit(&mut ctx, &platform).unwrap();
        let ModuleState::Firewall(after) = state else { panic!() };
        assert_eq!(after.active, TriState::On);
        assert!(after.rules.iter().any(|r| r == "2222/tcp"));
    }

    #[test]
    fn replay_after_activation_skips_all_steps() {
        let mut ctx = MemoryContext::new();
        ctx.seed_package("ufw");

        let module = FirewallModule;
        let platform = debian();
        let plan = firewall_plan();

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

    #[test]
    fn alpine_without_ufw_is_unsupported() {
        let mut ctx = MemoryContext::new();

        let module = FirewallModule;
        let platform = alpine();
        let plan = firewall_plan();
        let state = module.audit(&mut ctx, &platform).unwrap();

        match module.plan(&mut ctx, &platform, &plan, &state) {
            Err(HardnError::UnsupportedPlatform { family, concern }) => {
                assert_eq!(family, Family::Alpine);
                assert_eq!(concern, Concern::Firewall);
            }
            other => panic!("expected UnsupportedPlatform, got {other:?}"),
        }
    }

    #[test]
    fn alpine_with_ufw_installed_is_supported() {
        let mut ctx = MemoryContext::new();
        ctx.seed_package("ufw");

        let module = FirewallModule;
        let platform = alpine();
        let plan = firewall_plan();
        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();
        assert!(!steps.is_empty());
    }

    #[test]
    fn missing_applications_dir_is_created() {
        let mut ctx = MemoryContext::new();
        ctx.seed_package("ufw");

        let module = FirewallModule;
        let platform = debian();
        let plan = firewall_plan();
        let state = module.audit(&mut ctx, &platform).unwrap();
        let steps = module.plan(&mut ctx, &platform, &plan, &state).unwrap();
        module.apply(&mut ctx, &platform, steps);

        assert!(ctx.has_dir(APP_PROFILE_DIR));
    }
}
