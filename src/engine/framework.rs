use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{HardnError, HardnResult};
use crate::core::plan::HardeningPlan;
use crate::core::platform::{Family, PlatformInfo};
use crate::core::status::TriState;
use crate::execution::context::{ExecutionContext, Owner};

/// One hardening topic, owned by exactly one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concern {
    Sources,
    User,
    Ssh,
    Firewall,
    Dns,
    AppArmor,
    Upgrades,
    Lynis,
}

impl Concern {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sources => "sources",
            Self::User => "user",
            Self::Ssh => "ssh",
            Self::Firewall => "firewall",
            Self::Dns => "dns",
            Self::AppArmor => "apparmor",
            Self::Upgrades => "upgrades",
            Self::Lynis => "lynis",
        }
    }
}

impl std::fmt::Display for Concern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a package ended up on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallMethod {
    Package,
    Tarball,
}

/// Short structured record of one mutation. Human text comes from the
/// `Display` impl only; nothing downstream parses these strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Rewrote(PathBuf),
    AppendedLine(PathBuf),
    CreatedDir(PathBuf),
    Ran(Vec<String>),
    InstalledPackage { name: String, method: InstallMethod },
    ServiceConverged {
        unit: String,
        active: Option<bool>,
        enabled: Option<bool>,
    },
    Restarted(String),
    ReplacedSymlink(PathBuf),
    WroteSudoers(PathBuf),
    WroteAuthorizedKeys(PathBuf),
    RefreshedPackageIndex,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Rewrote(p) => write!(f, "rewrote {}", p.display()),
            Action::AppendedLine(p) => write!(f, "appended line to {}", p.display()),
            Action::CreatedDir(p) => write!(f, "created {}", p.display()),
            Action::Ran(argv) => write!(f, "{}", argv.join(" ")),
            Action::InstalledPackage { name, method } => match method {
                InstallMethod::Package => write!(f, "installed package {name}"),
                InstallMethod::Tarball => write!(f, "installed {name} from upstream tarball"),
            },
            Action::ServiceConverged {
                unit,
                active,
                enabled,
            } => {
                write!(f, "service {unit}:")?;
                if let Some(a) = active {
                    write!(f, " {}", if *a { "started" } else { "stopped" })?;
                }
                if let Some(e) = enabled {
                    write!(f, " {}", if *e { "enabled" } else { "disabled" })?;
                }
                Ok(())
            }
            Action::Restarted(unit) => write!(f, "restarted {unit}"),
            Action::ReplacedSymlink(p) => write!(f, "replaced symlink {} with a regular file (destructive)", p.display()),
            Action::WroteSudoers(p) => write!(f, "installed sudoers fragment {}", p.display()),
            Action::WroteAuthorizedKeys(p) => write!(f, "updated {}", p.display()),
            Action::RefreshedPackageIndex => write!(f, "refreshed package index"),
        }
    }
}

/// Why a planned step was not performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyInDesiredState,
    Unsupported { family: Family },
    DependencyFailed,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AlreadyInDesiredState => f.write_str("already in desired state"),
            SkipReason::Unsupported { family } => write!(f, "unsupported on {family}"),
            SkipReason::DependencyFailed => f.write_str("earlier fatal step failed"),
        }
    }
}

/// Typed postcondition for command steps; satisfied probes turn the step
/// into a skip on replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    UserExists(String),
    UserInGroup { user: String, group: String },
    FirewallActive,
    FirewallDefaultDeny,
    FirewallOutboundAllow,
    FirewallRuleExists(String),
}

/// One planned operation. Modules emit these; the shared executor in
/// `engine::executor` performs them with a uniform skip/backup/dry-run
/// discipline.
#[derive(Debug, Clone)]
pub enum Step {
    EnsureDir {
        path: PathBuf,
        mode: u32,
        owner: Owner,
    },
    /// Full-file replacement carrying the managed header.
    WriteManaged {
        path: PathBuf,
        content: String,
        mode: u32,
        owner: Owner,
        /// Set when the write knowingly replaces a symlink.
        destructive_symlink: bool,
    },
    /// In-place directive edits for files hardn does not own wholesale.
    ReplaceDirectives {
        path: PathBuf,
        directives: Vec<(String, String)>,
    },
    EnsureLine {
        path: PathBuf,
        line: String,
    },
    Command {
        argv: Vec<String>,
        stdin: Option<Vec<u8>>,
        timeout: Option<Duration>,
        done: Option<Probe>,
        /// A failure here aborts the rest of the module's steps.
        fatal: bool,
        /// Run only when an earlier step in this module changed state
        /// (reload-style follow-ups).
        only_if_changed: bool,
    },
    InstallPackage {
        name: String,
    },
    Service {
        logical: String,
        active: Option<bool>,
        enabled: Option<bool>,
    },
    RestartService {
        logical: String,
        /// Restart only when an earlier step in this module changed state.
        only_if_changed: bool,
    },
    /// visudo-gated sudoers fragment install.
    Sudoers {
        path: PathBuf,
        content: String,
    },
    /// Merge (or replace) the account's authorized_keys.
    AuthorizedKeys {
        user: String,
        home: PathBuf,
        keys: Vec<String>,
        replace: bool,
    },
    /// apt-get update / apk update, once, after source list changes.
    RefreshPackageIndex {
        only_if_changed: bool,
    },
}

/// Structured outcome record for a single concern's Apply.
#[derive(Debug)]
pub struct ModuleResult {
    pub concern: Concern,
    pub intended: Vec<Action>,
    pub performed: Vec<Action>,
    pub skipped: Vec<(Action, SkipReason)>,
    pub backups: Vec<PathBuf>,
    pub errors: Vec<HardnError>,
}

impl ModuleResult {
    pub fn new(concern: Concern) -> Self {
        Self {
            concern,
            intended: Vec::new(),
            performed: Vec::new(),
            skipped: Vec::new(),
            backups: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn unsupported(concern: Concern, family: Family) -> Self {
        let mut result = Self::new(concern);
        result.skipped.push((
            Action::Ran(vec![concern.as_str().to_string()]),
            SkipReason::Unsupported { family },
        ));
        result
    }

    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Audit state records
// ---------------------------------------------------------------------------

/// Effective sshd configuration after first-match merging.
#[derive(Debug, Clone, Default)]
pub struct SshState {
    pub port: Option<u16>,
    pub permit_root_login: Option<String>,
    pub password_auth: Option<String>,
    pub pubkey_auth: Option<String>,
    pub listen_addresses: Vec<String>,
    pub allow_users: Vec<String>,
    /// Current content of the managed drop-in, when present.
    pub dropin: Option<String>,
}

impl SshState {
    /// Root login is disabled iff the effective value is exactly "no".
    pub fn root_login_disabled(&self) -> bool {
        self.permit_root_login.as_deref() == Some("no")
    }
}

/// A non-system account from the user database.
#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: String,
}

#[derive(Debug, Clone, Default)]
pub struct UserState {
    /// All non-system accounts (uid >= 1000, excluding nobody).
    pub non_system_users: Vec<AccountInfo>,
    /// Members of the platform's admin group (sudo or wheel).
    pub sudo_users: Vec<String>,
    /// Accounts holding a populated, correctly-moded authorized_keys.
    pub users_with_keys: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FirewallState {
    pub available: bool,
    pub installed: bool,
    pub active: TriState,
    pub default_deny: TriState,
    pub rules: Vec<String>,
}

/// Which mechanism manages the resolver on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverFlavor {
    SystemdResolved,
    Resolvconf,
    Direct,
}

#[derive(Debug, Clone)]
pub struct DnsState {
    pub flavor: ResolverFlavor,
    pub nameservers: Vec<String>,
    pub resolv_conf_is_symlink: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SourcesState {
    pub distro: Option<String>,
    pub proxmox_ceph: Option<String>,
    pub proxmox_enterprise: Option<String>,
    pub apk_repositories: Option<String>,
}

/// Shared state shape for the thin install-and-enable concerns.
#[derive(Debug, Clone, Default)]
pub struct ToolState {
    pub installed: bool,
    pub active: TriState,
    pub enabled: TriState,
}

/// Per-concern audit result, one variant per module family.
#[derive(Debug, Clone)]
pub enum ModuleState {
    Ssh(SshState),
    User(UserState),
    Firewall(FirewallState),
    Dns(DnsState),
    Sources(SourcesState),
    Tool(ToolState),
    /// The concern has no mechanism on this platform.
    Unsupported,
}

// ---------------------------------------------------------------------------
// Module contract
// ---------------------------------------------------------------------------

/// Contract every hardening concern implements. `audit` is strictly
/// read-only; `plan` turns the operator's intent plus the audited state into
/// typed steps; `apply` defaults to the shared executor and is only
/// overridden where a concern needs bespoke sequencing (Lynis fallback).
pub trait ConcernModule {
    fn concern(&self) -> Concern;

    fn audit(
        &self,
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
    ) -> HardnResult<ModuleState>;

    fn plan(
        &self,
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
        plan: &HardeningPlan,
        state: &ModuleState,
    ) -> HardnResult<Vec<Step>>;

    fn apply(
        &self,
        ctx: &mut dyn ExecutionContext,
        platform: &PlatformInfo,
        steps: Vec<Step>,
    ) -> ModuleResult {
        crate::engine::executor::apply_steps(ctx, platform, self.concern(), steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_display_is_short_and_structured() {
        let action = Action::Rewrote(PathBuf::from("/etc/ssh/sshd_config.d/hardn.conf"));
        assert_eq!(
            action.to_string(),
            "rewrote /etc/ssh/sshd_config.d/hardn.conf"
        );

        let action = Action::Ran(vec!["ufw".into(), "allow".into(), "2222/tcp".into()]);
        assert_eq!(action.to_string(), "ufw allow 2222/tcp");
    }

    #[test]
    fn skip_reason_wording_is_stable() {
        assert_eq!(
            SkipReason::AlreadyInDesiredState.to_string(),
            "already in desired state"
        );
        assert_eq!(
            SkipReason::Unsupported {
                family: Family::Alpine
            }
            .to_string(),
            "unsupported on alpine"
        );
    }

    #[test]
    fn ssh_state_root_login_requires_explicit_no() {
        let mut state = SshState::default();
        assert!(!state.root_login_disabled());
        state.permit_root_login = Some("prohibit-password".into());
        assert!(!state.root_login_disabled());
        state.permit_root_login = Some("no".into());
        assert!(state.root_login_disabled());
    }
}
