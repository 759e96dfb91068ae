pub mod apparmor;
pub mod dns;
pub mod firewall;
pub mod lynis;
pub mod sources;
pub mod ssh;
pub mod upgrades;
pub mod user;

pub use apparmor::ApparmorModule;
pub use dns::DnsModule;
pub use firewall::FirewallModule;
pub use lynis::LynisModule;
pub use sources::SourcesModule;
pub use ssh::SshModule;
pub use upgrades::UpgradesModule;
pub use user::UserModule;
