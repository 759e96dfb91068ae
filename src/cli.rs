use std::path::PathBuf;

use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};

use crate::core::config::VERSION;
use crate::core::platform::PlatformInfo;
use crate::core::status::SecurityStatus;
use crate::engine::framework::ModuleResult;
use crate::engine::risk::RiskAssessment;

#[derive(Debug, Parser)]
#[command(
    name = "hardn",
    version = VERSION,
    about = "Audit and apply host-hardening actions on Debian-family and Alpine systems"
)]
pub struct Cli {
    /// Plan file; falls back to the HARDN_CONFIG environment variable.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sample the current security posture without changing anything.
    Audit,
    /// Converge the host on the configured plan.
    Apply {
        /// Record every intended mutation without performing any.
        #[arg(long)]
        dry_run: bool,
    },
    /// Install a sudoers fragment that preserves HARDN_CONFIG across sudo.
    SetupSudoEnv,
}

/// Render the posture snapshot the way the teacher's report screen does:
/// one row per signal, risk summary underneath.
pub fn render_status(
    platform: &PlatformInfo,
    status: &SecurityStatus,
    risk: &RiskAssessment,
    subnets: &[String],
) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Signal", "State"]);
    table.add_row(vec!["SSH root login", status.ssh_root_login.as_str()]);
    table.add_row(vec!["SSH password auth", status.ssh_password_auth.as_str()]);
    table.add_row(vec![
        "SSH port".to_string(),
        status
            .ssh_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    ]);
    table.add_row(vec!["Firewall active", status.firewall_active.as_str()]);
    table.add_row(vec![
        "Firewall configured",
        status.firewall_configured.as_str(),
    ]);
    table.add_row(vec![
        "Non-system users".to_string(),
        count_cell(status.non_system_user_count),
    ]);
    table.add_row(vec![
        "Sudo users".to_string(),
        count_cell(status.sudo_user_count),
    ]);
    table.add_row(vec!["AppArmor", status.apparmor_active.as_str()]);
    table.add_row(vec![
        "Unattended upgrades",
        status.unattended_upgrades_active.as_str(),
    ]);

    println!(
        "\nHost: {} {} ({}) kernel {} [{}]",
        platform.family, platform.version, platform.codename, platform.kernel, platform.init
    );
    if !subnets.is_empty() {
        println!("Local subnets: {}", subnets.join(", "));
    }
    println!("{table}");
    println!("Risk: {} (score {}) — {}\n", risk.level, risk.score, risk.rationale);
}

fn count_cell(count: Option<u32>) -> String {
    count
        .map(|c| c.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// One summary line per module, in run order.
pub fn render_results(results: &[ModuleResult]) {
    for result in results {
        println!(
            "{:<10} performed {:>2}, skipped {:>2}, errors {:>2}",
            result.concern.to_string(),
            result.performed.len(),
            result.skipped.len(),
            result.errors.len()
        );
        for action in &result.performed {
            println!("           + {action}");
        }
        for (action, reason) in &result.skipped {
            println!("           = {action} ({reason})");
        }
        for error in &result.errors {
            println!("           ! {error}");
        }
        for backup in &result.backups {
            println!("           ~ backup {}", backup.display());
        }
    }
}
