pub mod backup;
pub mod context;
pub mod host;
pub mod memory;
pub mod mutator;
pub mod service;

pub use context::{CommandOutput, CommandSpec, ExecutionContext, Owner, ServiceStatus};
