use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::core::config::debug_enabled;

/// Log levels for colored console output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Pass,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn color_code(&self) -> &'static str {
        match self {
            Self::Pass => "\x1b[1;32m",    // Green
            Self::Info => "\x1b[1;34m",    // Blue
            Self::Warning => "\x1b[1;33m", // Yellow
            Self::Error => "\x1b[1;31m",   // Red
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Pass => "[PASS]",
            Self::Info => "[INFO]",
            Self::Warning => "[WARNING]",
            Self::Error => "[ERROR]",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}{}", self.color_code(), self.prefix(), "\x1b[0m")
    }
}

/// Print a single console line with the level prefix.
pub fn log_message(level: LogLevel, message: &str) {
    if level == LogLevel::Info && !debug_enabled() {
        return;
    }
    println!("{} {}", level, message);
}

/// One structured event, serialized as a JSON line in the log file and
/// retained in the in-memory ring for display.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogEvent {
    pub ts: DateTime<Utc>,
    pub level: &'static str,
    pub concern: Option<String>,
    pub message: String,
}

/// Number of events retained for on-screen tailing.
const RING_CAPACITY: usize = 512;

/// Structured logger: colored console prefixes plus an optional
/// append-only JSON-lines file and a bounded in-memory ring.
pub struct Logger {
    file: Option<PathBuf>,
    ring: VecDeque<LogEvent>,
}

impl Logger {
    pub fn new(file: Option<PathBuf>) -> Self {
        if let Some(path) = &file {
            if let Some(dir) = path.parent() {
                if !dir.exists() {
                    let _ = fs::DirBuilder::new()
                        .recursive(true)
                        .mode(0o750)
                        .create(dir);
                }
            }
        }
        Self {
            file,
            ring: VecDeque::with_capacity(RING_CAPACITY),
        }
    }

    pub fn event(&mut self, level: LogLevel, concern: Option<&str>, message: &str) {
        log_message(level, message);

        let event = LogEvent {
            ts: Utc::now(),
            level: match level {
                LogLevel::Pass => "pass",
                LogLevel::Info => "info",
                LogLevel::Warning => "warning",
                LogLevel::Error => "error",
            },
            concern: concern.map(str::to_string),
            message: message.to_string(),
        };

        if let Some(path) = &self.file {
            if let Err(e) = append_json_line(path, &event) {
                eprintln!("Warning: could not write log file {}: {}", path.display(), e);
            }
        }

        if self.ring.len() == RING_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(event);
    }

    pub fn pass(&mut self, concern: Option<&str>, message: &str) {
        self.event(LogLevel::Pass, concern, message);
    }

    pub fn info(&mut self, concern: Option<&str>, message: &str) {
        self.event(LogLevel::Info, concern, message);
    }

    pub fn warning(&mut self, concern: Option<&str>, message: &str) {
        self.event(LogLevel::Warning, concern, message);
    }

    pub fn error(&mut self, concern: Option<&str>, message: &str) {
        self.event(LogLevel::Error, concern, message);
    }

    /// Most recent events, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &LogEvent> {
        self.ring.iter()
    }
}

fn append_json_line(path: &Path, event: &LogEvent) -> std::io::Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(event)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writeln!(f, "{line}")?;
    Ok(())
}
