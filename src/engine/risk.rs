use serde::{Deserialize, Serialize};

use crate::core::platform::Family;
use crate::core::status::{SecurityStatus, TriState};

/// Fixed integer weights for each insecure signal.
const W_ROOT_LOGIN: u32 = 40;
const W_PASSWORD_AUTH: u32 = 20;
const W_DEFAULT_SSH_PORT: u32 = 10;
const W_FIREWALL_INACTIVE: u32 = 25;
const W_FIREWALL_UNCONFIGURED: u32 = 10;
const W_NO_SUDO_USER: u32 = 15;
const W_NO_UNATTENDED_UPGRADES: u32 = 10;
const W_NO_APPARMOR: u32 = 5;
const W_UNKNOWN: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
    Minimal,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Critical => write!(f, "Critical"),
            RiskLevel::High => write!(f, "High"),
            RiskLevel::Medium => write!(f, "Medium"),
            RiskLevel::Low => write!(f, "Low"),
            RiskLevel::Minimal => write!(f, "Minimal"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub score: u32,
    pub level: RiskLevel,
    pub rationale: String,
}

fn level_for(score: u32) -> RiskLevel {
    match score {
        70.. => RiskLevel::Critical,
        50..=69 => RiskLevel::High,
        30..=49 => RiskLevel::Medium,
        10..=29 => RiskLevel::Low,
        _ => RiskLevel::Minimal,
    }
}

/// Deterministic weighted sum over the posture snapshot. Pure: same input,
/// same score, no host access.
pub fn score(status: &SecurityStatus, family: Family) -> RiskAssessment {
    let mut total = 0u32;
    let mut factors: Vec<&'static str> = Vec::new();

    match status.ssh_root_login {
        TriState::On => {
            total += W_ROOT_LOGIN;
            factors.push("root SSH login enabled");
        }
        TriState::Unknown => total += W_UNKNOWN,
        TriState::Off => {}
    }

    match status.ssh_password_auth {
        TriState::On => {
            total += W_PASSWORD_AUTH;
            factors.push("SSH password authentication enabled");
        }
        TriState::Unknown => total += W_UNKNOWN,
        TriState::Off => {}
    }

    match status.ssh_port {
        Some(22) => {
            total += W_DEFAULT_SSH_PORT;
            factors.push("SSH on default port 22");
        }
        Some(_) => {}
        None => total += W_UNKNOWN,
    }

    match status.firewall_active {
        TriState::Off => {
            total += W_FIREWALL_INACTIVE;
            factors.push("firewall inactive");
        }
        TriState::Unknown => total += W_UNKNOWN,
        TriState::On => match status.firewall_configured {
            TriState::Off => {
                total += W_FIREWALL_UNCONFIGURED;
                factors.push("firewall active without a deny default");
            }
            TriState::Unknown => total += W_UNKNOWN,
            TriState::On => {}
        },
    }

    match status.sudo_user_count {
        Some(0) => {
            total += W_NO_SUDO_USER;
            factors.push("no non-system sudo user");
        }
        Some(_) => {}
        None => total += W_UNKNOWN,
    }

    if status.non_system_user_count.is_none() {
        total += W_UNKNOWN;
    }

    if family.is_debian_like() {
        match status.unattended_upgrades_active {
            TriState::Off => {
                total += W_NO_UNATTENDED_UPGRADES;
                factors.push("unattended upgrades not active");
            }
            TriState::Unknown => total += W_UNKNOWN,
            TriState::On => {}
        }
        match status.apparmor_active {
            TriState::Off => {
                total += W_NO_APPARMOR;
                factors.push("AppArmor not active");
            }
            TriState::Unknown => total += W_UNKNOWN,
            TriState::On => {}
        }
    }

    let level = level_for(total);
    let rationale = if factors.is_empty() {
        "no insecure signals detected".to_string()
    } else {
        factors.join(", ")
    };

    RiskAssessment {
        score: total,
        level,
        rationale,
    }
}
