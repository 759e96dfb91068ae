use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::error::HardnResult;
use crate::execution::backup::BackupRecord;

/// Default per-command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Ownership to apply when writing a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    /// Preserve the pre-existing owner, or root for a new file.
    KeepExisting,
    Root,
    /// A named account; the implementation resolves uid/gid.
    User(String),
}

/// Lightweight stat result; `None` from [`ExecutionContext::stat`] means the
/// path does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub is_dir: bool,
    pub is_symlink: bool,
    /// Target of the link when `is_symlink` is set.
    pub symlink_target: Option<PathBuf>,
    pub mode: u32,
}

/// Fully specified subprocess invocation. Argv list only; nothing is ever
/// handed to a shell.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    /// Mutating commands are suppressed (and recorded) under dry-run;
    /// queries always execute for real.
    pub mutating: bool,
}

impl CommandSpec {
    pub fn query(argv: &[&str]) -> Self {
        Self {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            stdin: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            mutating: false,
        }
    }

    pub fn mutating(argv: &[&str]) -> Self {
        Self {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            stdin: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            mutating: true,
        }
    }

    pub fn with_stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit == 0
    }
}

/// Service state as reported by the init system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceStatus {
    pub present: bool,
    pub active: bool,
    pub enabled: bool,
}

/// Record of a mutation suppressed by dry-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntendedAction {
    WriteFile { path: PathBuf, mode: u32 },
    EnsureDir { path: PathBuf, mode: u32 },
    RunCommand { argv: Vec<String> },
    ServiceChange {
        unit: String,
        active: Option<bool>,
        enabled: Option<bool>,
    },
}

/// The single capability handle threaded through every module.
///
/// Real runs use [`HostContext`](crate::execution::host::HostContext);
/// the test suite drives the engine through
/// [`MemoryContext`](crate::execution::memory::MemoryContext).
pub trait ExecutionContext {
    fn dry_run(&self) -> bool;

    // -- filesystem --

    fn read_file(&mut self, path: &Path) -> HardnResult<Vec<u8>>;

    fn stat(&mut self, path: &Path) -> Option<FileInfo>;

    /// Entries of a directory, sorted lexicographically. Missing directory
    /// yields an empty list.
    fn list_dir(&mut self, path: &Path) -> Vec<PathBuf>;

    /// Atomic whole-file replacement: sibling temp file, fsync, rename.
    /// Any pre-existing regular file (or symlink) is backed up first and the
    /// returned record points at the copy. Under dry-run the record is
    /// synthetic (`copy_path` empty) and nothing on disk changes.
    fn write_file_atomic(
        &mut self,
        path: &Path,
        bytes: &[u8],
        mode: u32,
        owner: Owner,
    ) -> HardnResult<BackupRecord>;

    fn ensure_dir(&mut self, path: &Path, mode: u32, owner: Owner) -> HardnResult<()>;

    // -- subprocesses --

    fn run_command(&mut self, spec: &CommandSpec) -> HardnResult<CommandOutput>;

    /// Convenience wrapper for read-only commands.
    fn run_query(&mut self, argv: &[&str]) -> HardnResult<CommandOutput> {
        self.run_command(&CommandSpec::query(argv))
    }

    // -- services --

    fn query_service(&mut self, unit: &str) -> ServiceStatus;

    fn set_service_state(
        &mut self,
        unit: &str,
        active: Option<bool>,
        enabled: Option<bool>,
    ) -> HardnResult<()>;

    // -- environment --

    fn local_subnets(&mut self) -> Vec<String>;

    fn now(&self) -> DateTime<Utc>;

    /// Take the exclusive advisory run lock under `backup_root`. Held until
    /// process exit; `AlreadyRunning` if another run holds it.
    fn lock_run(&mut self, backup_root: &Path) -> HardnResult<()>;

    /// Mutations suppressed so far by dry-run, in order.
    fn intended_log(&self) -> &[IntendedAction];

    /// Convenience: file contents as UTF-8, `None` when absent or invalid.
    fn read_to_string(&mut self, path: &Path) -> Option<String> {
        self.read_file(path)
            .ok()
            .and_then(|b| String::from_utf8(b).ok())
    }
}
