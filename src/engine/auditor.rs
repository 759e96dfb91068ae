use crate::core::platform::PlatformInfo;
use crate::core::status::{SecurityStatus, TriState};
use crate::engine::framework::{ConcernModule, ModuleState};
use crate::execution::context::ExecutionContext;
use crate::modules::{
    ApparmorModule, FirewallModule, SshModule, UpgradesModule, UserModule,
};

/// Read-only composition over the module audits. Never mutates anything;
/// this is the path the status display samples on demand.
pub fn collect(ctx: &mut dyn ExecutionContext, platform: &PlatformInfo) -> SecurityStatus {
    let mut status = SecurityStatus::unknown();

    if let Ok(ModuleState::Ssh(ssh)) = SshModule.audit(ctx, platform) {
        if crate::modules::ssh::config_readable(ctx) {
            status.ssh_root_login = TriState::from_bool(!ssh.root_login_disabled());
            // The daemon default is password auth on; only an effective
            // "no" turns the signal off.
            status.ssh_password_auth =
                TriState::from_bool(ssh.password_auth.as_deref() != Some("no"));
            status.ssh_port = Some(ssh.port.unwrap_or(22));
        }
    }

    if let Ok(ModuleState::Firewall(firewall)) = FirewallModule.audit(ctx, platform) {
        status.firewall_active = firewall.active;
        status.firewall_configured = firewall.default_deny;
    }

    if let Ok(ModuleState::User(users)) = UserModule.audit(ctx, platform) {
        status.non_system_user_count = Some(users.non_system_users.len() as u32);
        let sudo_count = users
            .sudo_users
            .iter()
            .filter(|name| users.non_system_users.iter().any(|a| &a.name == *name))
            .count();
        status.sudo_user_count = Some(sudo_count as u32);
    }

    status.apparmor_active = match ApparmorModule.audit(ctx, platform) {
        Ok(ModuleState::Tool(tool)) => tool.active,
        // No mechanism on this platform: known-off, not unknown.
        Ok(ModuleState::Unsupported) => TriState::Off,
        _ => TriState::Unknown,
    };

    status.unattended_upgrades_active = match UpgradesModule.audit(ctx, platform) {
        Ok(ModuleState::Tool(tool)) => tool.active,
        Ok(ModuleState::Unsupported) => TriState::Off,
        _ => TriState::Unknown,
    };

    status
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn unreadable_host_yields_unknowns() {
        let mut ctx = MemoryContext::new();
        // Force the firewall probe to fail too.
        ctx.seed_package("ufw");
        ctx.script_command(&["ufw", "status", "verbose"], 1, "", "you must be root");

        let status = collect(&mut ctx, &debian());
        assert_eq!(status.ssh_root_login, TriState::Unknown);
        assert_eq!(status.ssh_port, None);
        assert_eq!(status.firewall_active, TriState::Unknown);
    }

    #[test]
    fn composed_snapshot_reflects_module_audits() {
        let mut ctx = MemoryContext::new();
        ctx.seed_file(
            "/etc/ssh/sshd_config",
            "PermitRootLogin no\nPasswordAuthentication no\nPort 2222\n",
        );
        ctx.seed_file(
            "/etc/passwd",
            "root:x:0:0::/root:/bin/bash\nops:x:1000:1000::/home/ops:/bin/bash\n",
        );
        ctx.seed_file("/etc/group", "sudo:x:27:ops\n");
        ctx.seed_package("ufw");
        ctx.seed_package("apparmor");
        ctx.seed_package("unattended-upgrades");
        ctx.seed_service("apparmor", true, true, true);
        ctx.seed_service("unattended-upgrades", true, true, true);
        ctx.script_command(
            &["ufw", "status", "verbose"],
            0,
            "Status: active\nDefault: deny (incoming), allow (outgoing), disabled (routed)\n2222/tcp                   ALLOW IN    Anywhere\n",
            "",
        );

        let status = collect(&mut ctx, &debian());
        assert_eq!(status.ssh_root_login, TriState::Off);
        assert_eq!(status.ssh_password_auth, TriState::Off);
        assert_eq!(status.ssh_port, Some(2222));
        assert_eq!(status.firewall_active, TriState::On);
        assert_eq!(status.firewall_configured, TriState::On);
        assert_eq!(status.non_system_user_count, Some(1));
        assert_eq!(status.sudo_user_count, Some(1));
        assert_eq!(status.apparmor_active, TriState::On);
        assert_eq!(status.unattended_upgrades_active, TriState::On);
    }

    #[test]
    fn default_port_and_password_auth_apply_when_directives_absent() {
        let mut ctx = MemoryContext::new();
        ctx.seed_file("/etc/ssh/sshd_config", "PermitRootLogin yes\n");

        let status = collect(&mut ctx, &debian());
        assert_eq!(status.ssh_root_login, TriState::On);
        assert_eq!(status.ssh_password_auth, TriState::On);
        assert_eq!(status.ssh_port, Some(22));
    }
}
