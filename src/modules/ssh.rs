use std::path::{Path, PathBuf};

use crate::core::error::{HardnError, HardnResult};
use crate::core::plan::HardeningPlan;
use crate::core::platform::{Family, PlatformInfo};
use crate::engine::framework::{
    Concern, ConcernModule, ModuleState, SshState, Step,
};
use crate::execution::context::{ExecutionContext, Owner};
use crate::execution::mutator::MODE_CONFIG;
use crate::execution::service::SVC_SSH;
use crate::modules::user::{planned_user_brings_keys, users_with_authorized_keys};

pub const MAIN_CONFIG: &str = "/etc/ssh/sshd_config";
pub const DROPIN_DIR: &str = "/etc/ssh/sshd_config.d";
pub const DROPIN_PATH: &str = "/etc/ssh/sshd_config.d/hardn.conf";

/// SSH daemon hardening: a dedicated drop-in on Debian-family hosts,
/// in-place directives on Alpine (stock Alpine sshd_config has no Include).
pub struct SshModule;

impl SshModule {
    /// Contents of every config source in merge order: the main file first,
    /// then drop-ins lexicographically. First occurrence of a keyword wins.
    fn config_sources(
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
    ) -> Vec<String> {
        let mut sources = Vec::new();
        if let Some(main) = ctx.read_to_string(MAIN_CONFIG.as_ref()) {
            sources.push(main);
        }
        if platform.family.is_debian_like() {
            let entries = ctx.list_dir(DROPIN_DIR.as_ref());
            for entry in entries {
                if entry.extension().and_then(|e| e.to_str()) == Some("conf") {
                    if let Some(content) = ctx.read_to_string(&entry) {
                        sources.push(content);
                    }
                }
            }
        }
        sources
    }

    pub fn effective_config(
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
    ) -> Option<SshState> {
        let sources = Self::config_sources(ctx, platform);
        if sources.is_empty() {
            return None;
        }

        let mut state = SshState {
            dropin: ctx.read_to_string(DROPIN_PATH.as_ref()),
            ..Default::default()
        };

        for content in &sources {
            for line in content.lines() {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                let mut tokens = trimmed.split_whitespace();
                let Some(keyword) = tokens.next() else { continue };
                let rest: Vec<&str> = tokens.collect();
                let value = rest.join(" ");
                if value.is_empty() {
                    continue;
                }
                match keyword.to_ascii_lowercase().as_str() {
                    "port" => {
                        if state.port.is_none() {
                            state.port = value.parse().ok();
                        }
                    }
                    "permitrootlogin" => {
                        if state.permit_root_login.is_none() {
                            state.permit_root_login = Some(value);
                        }
                    }
                    "passwordauthentication" => {
                        if state.password_auth.is_none() {
                            state.password_auth = Some(value);
                        }
                    }
                    "pubkeyauthentication" => {
                        if state.pubkey_auth.is_none() {
                            state.pubkey_auth = Some(value);
                        }
                    }
                    "listenaddress" => state.listen_addresses.push(value),
                    "allowusers" => {
                        if state.allow_users.is_empty() {
                            state.allow_users =
                                rest.iter().map(|s| s.to_string()).collect();
                        }
                    }
                    _ => {}
                }
            }
        }
        Some(state)
    }

    /// Refuse to turn off root login unless some non-system account can
    /// still get in with a key, or this very plan creates one.
    fn lockout_guard(
        ctx: &mut dyn ExecutionContext,
        plan: &HardeningPlan,
    ) -> HardnResult<()> {
        if planned_user_brings_keys(plan) {
            return Ok(());
        }
        if !users_with_authorized_keys(ctx).is_empty() {
            return Ok(());
        }
        Err(HardnError::LockoutRisk)
    }

    /// The managed directive list, in the fixed order the drop-in uses.
    fn directives(plan: &HardeningPlan) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let Some(ssh) = &plan.ssh else { return out };

        if let Some(port) = ssh.port {
            out.push(("Port".to_string(), port.to_string()));
        }
        if let Some(root) = ssh.permit_root_login {
            out.push((
                "PermitRootLogin".to_string(),
                if root { "yes" } else { "no" }.to_string(),
            ));
        }
        if let Some(pw) = ssh.password_auth {
            out.push((
                "PasswordAuthentication".to_string(),
                if pw { "yes" } else { "no" }.to_string(),
            ));
        }
        if let Some(pk) = ssh.key_auth {
            out.push((
                "PubkeyAuthentication".to_string(),
                if pk { "yes" } else { "no" }.to_string(),
            ));
        }
        out
    }
}

impl ConcernModule for SshModule {
    fn concern(&self) -> Concern {
        Concern::Ssh
    }

    fn audit(
        &self,
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
    ) -> HardnResult<ModuleState> {
        Ok(ModuleState::Ssh(
            Self::effective_config(ctx, platform).unwrap_or_default(),
        ))
    }

    fn plan(
        &self,
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
        plan: &HardeningPlan,
        state: &ModuleState,
    ) -> HardnResult<Vec<Step>> {
        let Some(ssh) = &plan.ssh else {
            return Ok(Vec::new());
        };
        let ModuleState::Ssh(current) = state else {
            return Ok(Vec::new());
        };

        // Guard only when the change is still ahead of us; a host already
        // converged must stay replayable.
        if ssh.permit_root_login == Some(false) && !current.root_login_disabled() {
            Self::lockout_guard(ctx, plan)?;
        }

        let directives = Self::directives(plan);
        let mut steps = Vec::new();

        if platform.family.is_debian_like() {
            let mut content = String::new();
            for (key, value) in &directives {
                content.push_str(&format!("{key} {value}\n"));
            }
            for addr in &ssh.listen_addresses {
                content.push_str(&format!("ListenAddress {addr}\n"));
            }
            if !ssh.allow_users.is_empty() {
                content.push_str(&format!("AllowUsers {}\n", ssh.allow_users.join(" ")));
            }
            if content.is_empty() {
                return Ok(Vec::new());
            }

            steps.push(Step::EnsureDir {
                path: PathBuf::from(DROPIN_DIR),
                mode: 0o755,
                owner: Owner::Root,
            });
            steps.push(Step::WriteManaged {
                path: PathBuf::from(DROPIN_PATH),
                content,
                mode: MODE_CONFIG,
                owner: Owner::Root,
                destructive_symlink: false,
            });
        } else {
            let mut in_place = directives;
            if !ssh.allow_users.is_empty() {
                in_place.push(("AllowUsers".to_string(), ssh.allow_users.join(" ")));
            }
            if in_place.is_empty() && ssh.listen_addresses.is_empty() {
                return Ok(Vec::new());
            }
            steps.push(Step::ReplaceDirectives {
                path: PathBuf::from(MAIN_CONFIG),
                directives: in_place,
            });
            for addr in &ssh.listen_addresses {
                steps.push(Step::EnsureLine {
                    path: PathBuf::from(MAIN_CONFIG),
                    line: format!("ListenAddress {addr}"),
                });
            }
        }

        steps.push(Step::RestartService {
            logical: SVC_SSH.to_string(),
            only_if_changed: true,
        });

        Ok(steps)
    }
}

/// Whether any sshd config was readable; `None` from the audit path means
/// every SSH signal is unknown.
pub fn config_readable(ctx: &mut dyn ExecutionContext) -> bool {
    ctx.stat(Path::new(MAIN_CONFIG)).is_some()
}
