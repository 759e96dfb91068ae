use serde::{Deserialize, Serialize};

/// Tri-state value for every audited signal. `Unknown` means the probe
/// could not decide, which the risk scorer penalizes separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    On,
    Off,
    Unknown,
}

impl TriState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_bool(value: bool) -> Self {
        if value {
            Self::On
        } else {
            Self::Off
        }
    }
}

impl std::fmt::Display for TriState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for TriState {
    fn default() -> Self {
        TriState::Unknown
    }
}

/// Read-only snapshot of the host's security posture, assembled by the
/// state auditor from the per-concern audits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityStatus {
    pub ssh_root_login: TriState,
    pub firewall_active: TriState,
    pub firewall_configured: TriState,
    pub non_system_user_count: Option<u32>,
    pub sudo_user_count: Option<u32>,
    pub ssh_port: Option<u16>,
    pub ssh_password_auth: TriState,
    pub apparmor_active: TriState,
    pub unattended_upgrades_active: TriState,
}

impl SecurityStatus {
    /// A snapshot where nothing could be determined.
    pub fn unknown() -> Self {
        Self {
            ssh_root_login: TriState::Unknown,
            firewall_active: TriState::Unknown,
            firewall_configured: TriState::Unknown,
            non_system_user_count: None,
            sudo_user_count: None,
            ssh_port: None,
            ssh_password_auth: TriState::Unknown,
            apparmor_active: TriState::Unknown,
            unattended_upgrades_active: TriState::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tri_state_round_trips_through_serde() {
        let json = serde_json::to_string(&TriState::Unknown).unwrap();
        assert_eq!(json, "\"unknown\"");
        let back: TriState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TriState::Unknown);
    }

    #[test]
    fn from_bool_maps_both_ways() {
        assert_eq!(TriState::from_bool(true), TriState::On);
        assert_eq!(TriState::from_bool(false), TriState::Off);
    }
}
