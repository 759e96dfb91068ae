use serde::{Deserialize, Serialize};

use crate::execution::context::ExecutionContext;

/// OS family governing which mechanism each concern uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Debian,
    Ubuntu,
    Alpine,
    Proxmox,
}

impl Family {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debian => "debian",
            Self::Ubuntu => "ubuntu",
            Self::Alpine => "alpine",
            Self::Proxmox => "proxmox",
        }
    }

    /// Proxmox is a Debian derivative; apt/ufw/apparmor flows apply to all
    /// three non-Alpine families.
    pub fn is_debian_like(self) -> bool {
        !matches!(self, Self::Alpine)
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitSystem {
    Systemd,
    OpenRc,
}

impl std::fmt::Display for InitSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Systemd => f.write_str("systemd"),
            Self::OpenRc => f.write_str("openrc"),
        }
    }
}

/// Immutable description of the host, established once at startup.
/// Downstream code consumes this value only; no module re-probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub family: Family,
    pub version: String,
    pub codename: String,
    pub kernel: String,
    pub init: InitSystem,
}

impl PlatformInfo {
    /// Detect the platform from /etc/os-release plus a handful of marker
    /// paths. All reads go through the execution context so the test suite
    /// can fake any host flavor.
    pub fn probe(ctx: &mut dyn ExecutionContext) -> Self {
        let os_release = ctx
            .read_file("/etc/os-release".as_ref())
            .ok()
            .and_then(|b| String::from_utf8(b).ok())
            .unwrap_or_default();

        let id = extract_os_field(&os_release, "ID");
        let version = extract_os_field(&os_release, "VERSION_ID");
        let codename = extract_os_field(&os_release, "VERSION_CODENAME");

        let family = if ctx.stat("/etc/pve".as_ref()).is_some() {
            Family::Proxmox
        } else {
            match id.as_str() {
                "ubuntu" => Family::Ubuntu,
                "alpine" => Family::Alpine,
                _ => Family::Debian,
            }
        };

        let init = if ctx.stat("/run/systemd/system".as_ref()).is_some() {
            InitSystem::Systemd
        } else if ctx.stat("/sbin/openrc-run".as_ref()).is_some()
            || family == Family::Alpine
        {
            InitSystem::OpenRc
        } else {
            InitSystem::Systemd
        };

        let kernel = ctx
            .run_query(&["uname", "-r"])
            .map(|out| out.stdout.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        PlatformInfo {
            family,
            version,
            codename,
            kernel,
            init,
        }
    }
}

/// Extract a field value from os-release format.
/// Handles both KEY=value and KEY="value" formats.
fn extract_os_field(content: &str, field_name: &str) -> String {
    content
        .lines()
        .find(|line| line.starts_with(&format!("{}=", field_name)))
        .and_then(|line| {
            line.split_once('=')
                .map(|(_, value)| value.trim_matches('"').to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::memory::MemoryContext;

    const DEBIAN_OS_RELEASE: &str = "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nID=debian\nVERSION_ID=\"12\"\nVERSION_CODENAME=bookworm\n";
    const ALPINE_OS_RELEASE: &str = "NAME=\"Alpine Linux\"\nID=alpine\nVERSION_ID=3.19.1\n";

    #[test]
    fn extract_os_field_handles_quoting() {
        assert_eq!(extract_os_field(DEBIAN_OS_RELEASE, "VERSION_ID"), "12");
        assert_eq!(
            extract_os_field(DEBIAN_OS_RELEASE, "VERSION_CODENAME"),
            "bookworm"
        );
        assert_eq!(extract_os_field(DEBIAN_OS_RELEASE, "MISSING"), "unknown");
    }

    #[test]
    fn probes_debian_bookworm() {
        let mut ctx = MemoryContext::new();
        ctx.seed_file("/etc/os-release", DEBIAN_OS_RELEASE);
        ctx.seed_dir("/run/systemd/system");
        ctx.script_command(&["uname", "-r"], 0, "6.1.0-18-amd64\n", "");

        let info = PlatformInfo::probe(&mut ctx);
        assert_eq!(info.family, Family::Debian);
        assert_eq!(info.codename, "bookworm");
        assert_eq!(info.init, InitSystem::Systemd);
        assert_eq!(info.kernel, "6.1.0-18-amd64");
    }

    #[test]
    fn pve_marker_wins_over_os_release_id() {
        let mut ctx = MemoryContext::new();
        ctx.seed_file("/etc/os-release", DEBIAN_OS_RELEASE);
        ctx.seed_dir("/etc/pve");
        ctx.seed_dir("/run/systemd/system");

        let info = PlatformInfo::probe(&mut ctx);
        assert_eq!(info.family, Family::Proxmox);
        assert!(info.family.is_debian_like());
    }

    #[test]
    fn alpine_defaults_to_openrc() {
        let mut ctx = MemoryContext::new();
        ctx.seed_file("/etc/os-release", ALPINE_OS_RELEASE);

        let info = PlatformInfo::probe(&mut ctx);
        assert_eq!(info.family, Family::Alpine);
        assert_eq!(info.init, InitSystem::OpenRc);
        assert!(!info.family.is_debian_like());
    }
}
