use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::{HardnError, HardnResult};
use crate::core::plan::HardeningPlan;

/// Application version - single source of truth
pub const VERSION: &str = "2.3.0";

/// Application name
pub const APP_NAME: &str = "HARDN";

/// Default directories
pub const DEFAULT_LOG_DIR: &str = "/var/log/hardn";
pub const DEFAULT_BACKUP_ROOT: &str = "/var/lib/hardn/backups";

/// Marker line placed at the top of every file this tool fully owns.
pub const MANAGED_HEADER: &str = "# managed by hardn — do not edit";

/// Exit codes
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_LOCKOUT: i32 = 3;
pub const EXIT_ALREADY_RUNNING: i32 = 4;
pub const EXIT_NEEDS_ROOT: i32 = 5;

/// Environment variables consumed at startup
pub const ENV_CONFIG: &str = "HARDN_CONFIG";
pub const ENV_DEBUG: &str = "HARDN_DEBUG";

/// Resolve the plan file path: explicit flag first, then `HARDN_CONFIG`.
pub fn config_path(flag: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = flag {
        return Some(p.to_path_buf());
    }
    match env::var(ENV_CONFIG) {
        Ok(v) if !v.trim().is_empty() => Some(PathBuf::from(v)),
        _ => None,
    }
}

/// Whether verbose logging was requested via `HARDN_DEBUG`.
pub fn debug_enabled() -> bool {
    matches!(env::var(ENV_DEBUG), Ok(v) if !v.is_empty())
}

/// Load and validate the operator's plan from a YAML file.
///
/// The engine only ever sees the immutable value returned here; nothing is
/// ever written back to the config file.
pub fn load_plan(path: &Path) -> HardnResult<HardeningPlan> {
    let raw = fs::read_to_string(path).map_err(|e| HardnError::io(path, "read", e))?;
    let plan: HardeningPlan = serde_yaml::from_str(&raw)
        .map_err(|e| HardnError::validation("config", e.to_string()))?;
    plan.validate()?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_plan_parses_minimal_yaml() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "ssh:\n  port: 2222\n  permit_root_login: false\nglobal:\n  dry_run: true"
        )
        .unwrap();

        let plan = load_plan(f.path()).unwrap();
        let ssh = plan.ssh.expect("ssh section");
        assert_eq!(ssh.port, Some(2222));
        assert_eq!(ssh.permit_root_login, Some(false));
        assert!(plan.global.dry_run);
    }

    #[test]
    fn load_plan_rejects_malformed_yaml() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "ssh: [not a mapping").unwrap();

        match load_plan(f.path()) {
            Err(HardnError::ValidationFailed { field, .. }) => assert_eq!(field, "config"),
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }
}
