use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::core::error::{HardnError, HardnResult};
use crate::core::platform::{Family, PlatformInfo};
use crate::execution::context::{CommandSpec, ExecutionContext, ServiceStatus};

/// Logical service names used by the concern modules. Translation to the
/// platform's unit name happens in one place only.
pub const SVC_SSH: &str = "ssh";
pub const SVC_RESOLVED: &str = "systemd-resolved";
pub const SVC_APPARMOR: &str = "apparmor";
pub const SVC_UNATTENDED_UPGRADES: &str = "unattended-upgrades";

/// (logical, family) -> platform unit name. Entries only exist where the
/// name differs from the logical one.
static UNIT_OVERRIDES: Lazy<HashMap<(&'static str, Family), &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert((SVC_SSH, Family::Alpine), "sshd");
    m
});

/// Resolve a logical service name for the given platform.
pub fn unit_name(logical: &str, family: Family) -> String {
    UNIT_OVERRIDES
        .get(&(logical, family))
        .map(|s| s.to_string())
        .unwrap_or_else(|| logical.to_string())
}

/// Platform-aware, idempotent service management over the execution
/// context's raw service capabilities.
pub struct ServiceController<'a> {
    platform: &'a PlatformInfo,
}

impl<'a> ServiceController<'a> {
    pub fn new(platform: &'a PlatformInfo) -> Self {
        Self { platform }
    }

    pub fn query(&self, ctx: &mut dyn ExecutionContext, logical: &str) -> ServiceStatus {
        let unit = unit_name(logical, self.platform.family);
        ctx.query_service(&unit)
    }

    /// Converge the service on the requested state. States that already
    /// match are skipped; returns whether anything was changed.
    pub fn converge(
        &self,
        ctx: &mut dyn ExecutionContext,
        logical: &str,
        active: Option<bool>,
        enabled: Option<bool>,
    ) -> HardnResult<bool> {
        let unit = unit_name(logical, self.platform.family);
        let current = ctx.query_service(&unit);

        let want_active = active.filter(|&a| a != current.active);
        let want_enabled = enabled.filter(|&e| e != current.enabled);
        if want_active.is_none() && want_enabled.is_none() {
            return Ok(false);
        }

        ctx.set_service_state(&unit, want_active, want_enabled)?;
        Ok(true)
    }

    /// Restart regardless of current state (config reload path).
    pub fn restart(&self, ctx: &mut dyn ExecutionContext, logical: &str) -> HardnResult<()> {
        let unit = unit_name(logical, self.platform.family);
        let argv: Vec<String> = match self.platform.init {
            crate::core::platform::InitSystem::Systemd => {
                vec!["systemctl".into(), "restart".into(), unit.clone()]
            }
            crate::core::platform::InitSystem::OpenRc => {
                vec!["rc-service".into(), unit.clone(), "restart".into()]
            }
        };
        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        let out = ctx.run_command(&CommandSpec::mutating(&argv_refs))?;
        if out.success() {
            Ok(())
        } else {
            Err(HardnError::CommandFailed {
                argv,
                exit: out.exit,
                stderr: out.stderr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::platform::InitSystem;
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
    fn ssh_unit_translates_on_alpine_only() {
        assert_eq!(unit_name(SVC_SSH, Family::Debian), "ssh");
        assert_eq!(unit_name(SVC_SSH, Family::Proxmox), "ssh");
        assert_eq!(unit_name(SVC_SSH, Family::Alpine), "sshd");
        assert_eq!(unit_name(SVC_APPARMOR, Family::Debian), "apparmor");
    }

    #[test]
    fn converge_skips_matching_state() {
        let platform = debian();
        let controller = ServiceController::new(&platform);
        let mut ctx = MemoryContext::new();
        ctx.seed_service("ssh", true, true, true);

        let changed = controller
            .converge(&mut ctx, SVC_SSH, Some(true), Some(true))
            .unwrap();
        assert!(!changed);
    }

    #[test]
    fn converge_applies_only_the_differing_half() {
        let platform = debian();
        let controller = ServiceController::new(&platform);
        let mut ctx = MemoryContext::new();
        ctx.seed_service("apparmor", true, false, true);

        let changed = controller
            .converge(&mut ctx, SVC_APPARMOR, Some(true), Some(true))
            .unwrap();
        assert!(changed);
        let status = ctx.query_service("apparmor");
        assert!(status.active && status.enabled);
    }

    #[test]
    fn restart_uses_rc_service_on_openrc() {
        let platform = alpine();
        let controller = ServiceController::new(&platform);
        let mut ctx = MemoryContext::new();

        controller.restart(&mut ctx, SVC_SSH).unwrap();

        let ran = &ctx.commands_run;
        assert_eq!(ran.len(), 1);
        assert_eq!(ran[0].argv, vec!["rc-service", "sshd", "restart"]);
        assert!(ran[0].mutating);
    }

    #[test]
    fn restart_failure_maps_to_command_failed() {
        let platform = debian();
        let controller = ServiceController::new(&platform);
        let mut ctx = MemoryContext::new();
        ctx.script_command(
            &["systemctl", "restart", "ssh"],
            1,
            "",
            "Job for ssh.service failed",
        );

        match controller.restart(&mut ctx, SVC_SSH) {
            Err(HardnError::CommandFailed { argv, exit, .. }) => {
                assert_eq!(argv[1], "restart");
                assert_eq!(exit, 1);
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }
}
