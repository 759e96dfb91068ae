pub mod logging;
pub mod paths;

pub use logging::{log_message, LogLevel, Logger};
