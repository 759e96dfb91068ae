use std::path::PathBuf;

use crate::core::error::HardnResult;
use crate::core::plan::HardeningPlan;
use crate::core::platform::{Family, PlatformInfo};
use crate::engine::framework::{
    AccountInfo, Concern, ConcernModule, ModuleState, Probe, Step, UserState,
};
use crate::execution::context::ExecutionContext;

/// Lowest uid treated as a human account on both Debian and Alpine.
const FIRST_NON_SYSTEM_UID: u32 = 1000;
/// The nobody account sits above the range but is never a login candidate.
const NOBODY_UID: u32 = 65534;

/// Admin group the platform's sudo policy honors.
pub fn admin_group(family: Family) -> &'static str {
    match family {
        Family::Alpine => "wheel",
        _ => "sudo",
    }
}

/// Non-system accounts parsed from the user database.
pub fn read_accounts(ctx: &mut dyn ExecutionContext) -> Vec<AccountInfo> {
    let Some(passwd) = ctx.read_to_string("/etc/passwd".as_ref()) else {
        return Vec::new();
    };
    let mut accounts = Vec::new();
    for line in passwd.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 {
            continue;
        }
        let Ok(uid) = fields[2].parse::<u32>() else { continue };
        let Ok(gid) = fields[3].parse::<u32>() else { continue };
        if uid < FIRST_NON_SYSTEM_UID || uid == NOBODY_UID {
            continue;
        }
        accounts.push(AccountInfo {
            name: fields[0].to_string(),
            uid,
            gid,
            home: PathBuf::from(fields[5]),
            shell: fields[6].to_string(),
        });
    }
    accounts
}

/// Accounts with a populated `~/.ssh/authorized_keys` at mode 0600 — the
/// candidates the SSH lockout guard accepts.
pub fn users_with_authorized_keys(ctx: &mut dyn ExecutionContext) -> Vec<AccountInfo> {
    let accounts = read_accounts(ctx);
    accounts
        .into_iter()
        .filter(|account| {
            let auth = account.home.join(".ssh").join("authorized_keys");
            let mode_ok = ctx.stat(&auth).is_some_and(|i| i.mode == 0o600);
            let populated = ctx
                .read_to_string(&auth)
                .is_some_and(|c| c.lines().any(|l| !l.trim().is_empty()));
            mode_ok && populated
        })
        .collect()
}

/// True when this very plan will create an account that arrives holding
/// authorized keys.
pub fn planned_user_brings_keys(plan: &HardeningPlan) -> bool {
    plan.user
        .as_ref()
        .is_some_and(|u| u.create_if_missing && !u.authorized_keys.is_empty())
}

/// Members of `group` in /etc/group.
fn group_members(ctx: &mut dyn ExecutionContext, group: &str) -> Vec<String> {
    let Some(groups) = ctx.read_to_string("/etc/group".as_ref()) else {
        return Vec::new();
    };
    for line in groups.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 4 && fields[0] == group {
            return fields[3]
                .split(',')
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
    Vec::new()
}

/// Non-root account provisioning: create, grant sudo, install keys.
pub struct UserModule;

impl ConcernModule for UserModule {
    fn concern(&self) -> Concern {
        Concern::User
    }

    fn audit(
        &self,
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
    ) -> HardnResult<ModuleState> {
        let non_system_users = read_accounts(ctx);
        let sudo_users = group_members(ctx, admin_group(platform.family));
        let users_with_keys = users_with_authorized_keys(ctx)
            .into_iter()
            .map(|a| a.name)
            .collect();
        Ok(ModuleState::User(UserState {
            non_system_users,
            sudo_users,
            users_with_keys,
        }))
    }

    fn plan(
        &self,
        _ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
        plan: &HardeningPlan,
        state: &ModuleState,
    ) -> HardnResult<Vec<Step>> {
        let Some(user) = &plan.user else {
            return Ok(Vec::new());
        };
        let ModuleState::User(current) = state else {
            return Ok(Vec::new());
        };

        let username = user.username.clone();
        let group = admin_group(platform.family);
        let mut steps = Vec::new();

        if user.create_if_missing {
            let argv: Vec<String> = match platform.family {
                Family::Alpine => vec![
                    "adduser".into(),
                    "-D".into(),
                    "-s".into(),
                    "/bin/ash".into(),
                    username.clone(),
                ],
                _ => vec![
                    "useradd".into(),
                    "-m".into(),
                    "-s".into(),
                    "/bin/bash".into(),
                    username.clone(),
                ],
            };
            steps.push(Step::Command {
                argv,
                stdin: None,
                timeout: None,
                done: Some(Probe::UserExists(username.clone())),
                fatal: true,
                only_if_changed: false,
            });
        }

        let group_argv: Vec<String> = match platform.family {
            Family::Alpine => vec!["addgroup".into(), username.clone(), group.into()],
            _ => vec!["usermod".into(), "-aG".into(), group.into(), username.clone()],
        };
        steps.push(Step::Command {
            argv: group_argv,
            stdin: None,
            timeout: None,
            done: Some(Probe::UserInGroup {
                user: username.clone(),
                group: group.to_string(),
            }),
            fatal: false,
            only_if_changed: false,
        });

        // Stock Alpine sudo ships without a wheel policy; install one so the
        // group grant actually means something.
        if platform.family == Family::Alpine {
            steps.push(Step::Sudoers {
                path: PathBuf::from("/etc/sudoers.d/wheel"),
                content: "%wheel ALL=(ALL) ALL".to_string(),
            });
        }

        let rule = if user.sudo_no_password {
            format!("{username} ALL=(ALL) NOPASSWD:ALL")
        } else {
            format!("{username} ALL=(ALL) ALL")
        };
        steps.push(Step::Sudoers {
            path: PathBuf::from(format!("/etc/sudoers.d/{username}")),
            content: rule,
        });

        if !user.authorized_keys.is_empty() {
            let home = current
                .non_system_users
                .iter()
                .find(|a| a.name == username)
                .map(|a| a.home.clone())
                .unwrap_or_else(|| PathBuf::from(format!("/home/{username}")));
            steps.push(Step::AuthorizedKeys {
                user: username,
                home,
                keys: user.authorized_keys.clone(),
                replace: user.replace_keys,
            });
        }

        Ok(steps)
    }
}
