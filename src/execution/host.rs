use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::core::error::{HardnError, HardnResult};
use crate::execution::backup::{BackupRecord, BackupStore};
use crate::execution::context::{
    CommandOutput, CommandSpec, ExecutionContext, FileInfo, IntendedAction, Owner, ServiceStatus,
};

/// True when the process runs with effective uid 0.
pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Which init system drives service operations on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostInit {
    Systemd,
    OpenRc,
}

/// The real-host execution context. All mutations honor the dry-run switch
/// and funnel through the backup store before touching their target.
pub struct HostContext {
    dry_run: bool,
    backup: BackupStore,
    intended: Vec<IntendedAction>,
    init: HostInit,
    // Held open for the life of the process so the advisory lock persists.
    _lock_file: Option<File>,
}

impl HostContext {
    pub fn new(backup_root: PathBuf, dry_run: bool) -> Self {
        let init = if Path::new("/run/systemd/system").exists() {
            HostInit::Systemd
        } else {
            HostInit::OpenRc
        };
        Self {
            dry_run,
            backup: BackupStore::new(backup_root, Utc::now()),
            intended: Vec::new(),
            init,
            _lock_file: None,
        }
    }

    pub fn run_id(&self) -> &str {
        self.backup.run_id()
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup.run_dir()
    }

    /// Resolve a named account to uid/gid from the user database.
    fn resolve_owner(&mut self, owner: &Owner, existing: Option<&fs::Metadata>) -> Option<(u32, u32)> {
        match owner {
            Owner::KeepExisting => existing.map(|m| (m.uid(), m.gid())),
            Owner::Root => Some((0, 0)),
            Owner::User(name) => {
                let passwd = fs::read_to_string("/etc/passwd").ok()?;
                for line in passwd.lines() {
                    let fields: Vec<&str> = line.split(':').collect();
                    if fields.len() >= 4 && fields[0] == name {
                        let uid = fields[2].parse().ok()?;
                        let gid = fields[3].parse().ok()?;
                        return Some((uid, gid));
                    }
                }
                None
            }
        }
    }

    fn spawn_with_timeout(&self, spec: &CommandSpec) -> HardnResult<CommandOutput> {
        let program = &spec.argv[0];

        // Output goes to unlinked temp files rather than pipes so a chatty
        // child can never fill a pipe buffer and stall the run.
        let mut stdout_file =
            tempfile_in_tmp().map_err(|e| HardnError::io("/tmp", "tempfile", e))?;
        let mut stderr_file =
            tempfile_in_tmp().map_err(|e| HardnError::io("/tmp", "tempfile", e))?;

        let mut child = Command::new(program)
            .args(&spec.argv[1..])
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::from(stdout_file.try_clone().map_err(|e| {
                HardnError::io("/tmp", "dup", e)
            })?))
            .stderr(Stdio::from(stderr_file.try_clone().map_err(|e| {
                HardnError::io("/tmp", "dup", e)
            })?))
            .spawn()
            .map_err(|e| HardnError::io(PathBuf::from(program), "spawn", e))?;

        if let Some(bytes) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(bytes);
            }
        }

        let deadline = Instant::now() + spec.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(HardnError::Timeout {
                            argv: spec.argv.clone(),
                            after_secs: spec.timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                Err(e) => return Err(HardnError::io(PathBuf::from(program), "wait", e)),
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        stdout_file.rewind().ok();
        stderr_file.rewind().ok();
        stdout_file.read_to_string(&mut stdout).ok();
        stderr_file.read_to_string(&mut stderr).ok();

        Ok(CommandOutput {
            stdout,
            stderr,
            exit: status.code().unwrap_or(-1),
        })
    }
}

fn tempfile_in_tmp() -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    // Create-and-unlink so nothing is left behind even on a crash.
    let path = std::env::temp_dir().join(format!(
        ".hardn-cmd-{}-{}",
        std::process::id(),
        Utc::now().timestamp_subsec_nanos()
    ));
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(&path)?;
    fs::remove_file(&path)?;
    Ok(file)
}

impl ExecutionContext for HostContext {
    fn dry_run(&self) -> bool {
        self.dry_run
    }

    fn read_file(&mut self, path: &Path) -> HardnResult<Vec<u8>> {
        fs::read(path).map_err(|e| HardnError::io(path, "read", e))
    }

    fn stat(&mut self, path: &Path) -> Option<FileInfo> {
        let meta = fs::symlink_metadata(path).ok()?;
        let is_symlink = meta.file_type().is_symlink();
        FileInfo {
            is_dir: meta.is_dir(),
            is_symlink,
            symlink_target: if is_symlink {
                fs::read_link(path).ok()
            } else {
                None
            },
            mode: meta.mode() & 0o7777,
        }
        .into()
    }

    fn list_dir(&mut self, path: &Path) -> Vec<PathBuf> {
        let mut entries: Vec<PathBuf> = match fs::read_dir(path) {
            Ok(rd) => rd.flatten().map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        };
        entries.sort();
        entries
    }

    fn write_file_atomic(
        &mut self,
        path: &Path,
        bytes: &[u8],
        mode: u32,
        owner: Owner,
    ) -> HardnResult<BackupRecord> {
        if self.dry_run {
            self.intended.push(IntendedAction::WriteFile {
                path: path.to_path_buf(),
                mode,
            });
            return Ok(BackupRecord::synthetic(path, self.backup.run_id(), Utc::now()));
        }

        let existing_meta = fs::symlink_metadata(path).ok();
        let record = if existing_meta.is_some() {
            self.backup.preserve(path, Utc::now())?
        } else {
            BackupRecord::synthetic(path, self.backup.run_id(), Utc::now())
        };

        let dir = path.parent().unwrap_or_else(|| Path::new("/"));
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                HardnError::io(path, "write", std::io::Error::other("path has no file name"))
            })?;
        let tmp = dir.join(format!(".{file_name}.hardn-tmp"));

        {
            let mut f = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp)
                .map_err(|e| HardnError::io(&tmp, "open", e))?;
            f.write_all(bytes).map_err(|e| HardnError::io(&tmp, "write", e))?;
            f.sync_all().map_err(|e| HardnError::io(&tmp, "fsync", e))?;
        }

        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))
            .map_err(|e| HardnError::io(&tmp, "chmod", e))?;
        if let Some((uid, gid)) = self.resolve_owner(&owner, existing_meta.as_ref()) {
            std::os::unix::fs::chown(&tmp, Some(uid), Some(gid))
                .map_err(|e| HardnError::io(&tmp, "chown", e))?;
        }

        fs::rename(&tmp, path).map_err(|e| HardnError::io(path, "rename", e))?;

        // Persist the rename itself.
        if let Ok(dirf) = File::open(dir) {
            let _ = dirf.sync_all();
        }

        Ok(record)
    }

    fn ensure_dir(&mut self, path: &Path, mode: u32, owner: Owner) -> HardnResult<()> {
        if self.dry_run {
            if !path.exists() {
                self.intended.push(IntendedAction::EnsureDir {
                    path: path.to_path_buf(),
                    mode,
                });
            }
            return Ok(());
        }
        if !path.exists() {
            fs::create_dir_all(path).map_err(|e| HardnError::io(path, "create_dir", e))?;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .map_err(|e| HardnError::io(path, "chmod", e))?;
            if let Some((uid, gid)) = self.resolve_owner(&owner, None) {
                std::os::unix::fs::chown(path, Some(uid), Some(gid))
                    .map_err(|e| HardnError::io(path, "chown", e))?;
            }
        }
        Ok(())
    }

    fn run_command(&mut self, spec: &CommandSpec) -> HardnResult<CommandOutput> {
        if spec.argv.is_empty() {
            return Err(HardnError::validation("argv", "empty command"));
        }
        if self.dry_run && spec.mutating {
            self.intended.push(IntendedAction::RunCommand {
                argv: spec.argv.clone(),
            });
            return Ok(CommandOutput::default());
        }
        self.spawn_with_timeout(spec)
    }

    fn query_service(&mut self, unit: &str) -> ServiceStatus {
        match self.init {
            HostInit::Systemd => {
                let load = self
                    .run_query(&["systemctl", "show", unit, "--property=LoadState"])
                    .map(|o| o.stdout.trim().to_string())
                    .unwrap_or_default();
                let present = load == "LoadState=loaded";
                let active = self
                    .run_query(&["systemctl", "is-active", unit])
                    .map(|o| o.stdout.trim() == "active")
                    .unwrap_or(false);
                let enabled = self
                    .run_query(&["systemctl", "is-enabled", unit])
                    .map(|o| o.stdout.trim() == "enabled")
                    .unwrap_or(false);
                ServiceStatus {
                    present,
                    active,
                    enabled,
                }
            }
            HostInit::OpenRc => {
                let present = self
                    .run_query(&["rc-service", "-e", unit])
                    .map(|o| o.success())
                    .unwrap_or(false);
                let active = self
                    .run_query(&["rc-service", unit, "status"])
                    .map(|o| o.success())
                    .unwrap_or(false);
                let enabled = self
                    .run_query(&["rc-update", "show", "default"])
                    .map(|o| o.stdout.lines().any(|l| l.split('|').next().unwrap_or("").trim() == unit))
                    .unwrap_or(false);
                ServiceStatus {
                    present,
                    active,
                    enabled,
                }
            }
        }
    }

    fn set_service_state(
        &mut self,
        unit: &str,
        active: Option<bool>,
        enabled: Option<bool>,
    ) -> HardnResult<()> {
        if self.dry_run {
            self.intended.push(IntendedAction::ServiceChange {
                unit: unit.to_string(),
                active,
                enabled,
            });
            return Ok(());
        }

        match self.init {
            HostInit::Systemd => {
                if let Some(on) = active {
                    let verb = if on { "start" } else { "stop" };
                    let out = self.run_command(&CommandSpec::mutating(&["systemctl", verb, unit]))?;
                    if !out.success() {
                        return Err(HardnError::CommandFailed {
                            argv: vec!["systemctl".into(), verb.into(), unit.into()],
                            exit: out.exit,
                            stderr: out.stderr,
                        });
                    }
                }
                if let Some(on) = enabled {
                    let verb = if on { "enable" } else { "disable" };
                    let out = self.run_command(&CommandSpec::mutating(&["systemctl", verb, unit]))?;
                    if !out.success() {
                        return Err(HardnError::CommandFailed {
                            argv: vec!["systemctl".into(), verb.into(), unit.into()],
                            exit: out.exit,
                            stderr: out.stderr,
                        });
                    }
                }
            }
            HostInit::OpenRc => {
                if let Some(on) = active {
                    let verb = if on { "start" } else { "stop" };
                    let out =
                        self.run_command(&CommandSpec::mutating(&["rc-service", unit, verb]))?;
                    if !out.success() {
                        return Err(HardnError::CommandFailed {
                            argv: vec!["rc-service".into(), unit.into(), verb.into()],
                            exit: out.exit,
                            stderr: out.stderr,
                        });
                    }
                }
                if let Some(on) = enabled {
                    let verb = if on { "add" } else { "del" };
                    let out = self.run_command(&CommandSpec::mutating(&[
                        "rc-update", verb, unit, "default",
                    ]))?;
                    if !out.success() {
                        return Err(HardnError::CommandFailed {
                            argv: vec!["rc-update".into(), verb.into(), unit.into(), "default".into()],
                            exit: out.exit,
                            stderr: out.stderr,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn local_subnets(&mut self) -> Vec<String> {
        let Ok(out) = self.run_query(&["ip", "-o", "-4", "addr", "show", "scope", "global"]) else {
            return Vec::new();
        };
        let mut subnets = Vec::new();
        for line in out.stdout.lines() {
            let mut fields = line.split_whitespace();
            while let Some(field) = fields.next() {
                if field == "inet" {
                    if let Some(cidr) = fields.next() {
                        subnets.push(cidr.to_string());
                    }
                    break;
                }
            }
        }
        subnets
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn lock_run(&mut self, backup_root: &Path) -> HardnResult<()> {
        fs::create_dir_all(backup_root)
            .map_err(|e| HardnError::io(backup_root, "create_dir", e))?;
        let lock_path = backup_root.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| HardnError::io(&lock_path, "open", e))?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(HardnError::AlreadyRunning);
        }
        self._lock_file = Some(file);
        Ok(())
    }

    fn intended_log(&self) -> &[IntendedAction] {
        &self.intended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx(dir: &Path, dry_run: bool) -> HostContext {
        HostContext::new(dir.join("backups"), dry_run)
    }

    #[test]
    fn atomic_write_creates_file_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_ctx(dir.path(), false);
        let target = dir.path().join("hardn.conf");

        let record = ctx
            .write_file_atomic(&target, b"Port 2222\n", 0o644, Owner::KeepExisting)
            .unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "Port 2222\n");
        assert_eq!(fs::metadata(&target).unwrap().mode() & 0o7777, 0o644);
        // Fresh file: nothing to back up.
        assert!(record.copy_path.as_os_str().is_empty());
    }

    #[test]
    fn atomic_write_backs_up_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_ctx(dir.path(), false);
        let target = dir.path().join("resolv.conf");
        fs::write(&target, "nameserver 9.9.9.9\n").unwrap();

        let record = ctx
            .write_file_atomic(&target, b"nameserver 1.1.1.1\n", 0o644, Owner::KeepExisting)
            .unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "nameserver 1.1.1.1\n");
        assert_eq!(
            fs::read_to_string(&record.copy_path).unwrap(),
            "nameserver 9.9.9.9\n"
        );
    }

    #[test]
    fn readers_never_observe_partial_content() {
        // Atomicity comes from rename; a reader opened between write and
        // rename sees the old bytes in full.
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_ctx(dir.path(), false);
        let target = dir.path().join("managed.conf");
        fs::write(&target, "old old old\n").unwrap();

        let before = fs::read_to_string(&target).unwrap();
        ctx.write_file_atomic(&target, b"new new new\n", 0o644, Owner::KeepExisting)
            .unwrap();
        let after = fs::read_to_string(&target).unwrap();

        assert_eq!(before, "old old old\n");
        assert_eq!(after, "new new new\n");
        // The temp sibling must be gone.
        assert!(!dir.path().join(".managed.conf.hardn-tmp").exists());
    }

    #[test]
    fn dry_run_writes_touch_nothing_and_record_intent() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_ctx(dir.path(), true);
        let target = dir.path().join("sshd.conf");
        fs::write(&target, "PermitRootLogin yes\n").unwrap();

        let record = ctx
            .write_file_atomic(&target, b"PermitRootLogin no\n", 0o644, Owner::KeepExisting)
            .unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "PermitRootLogin yes\n");
        assert!(record.copy_path.as_os_str().is_empty());
        assert_eq!(
            ctx.intended_log(),
            &[IntendedAction::WriteFile {
                path: target,
                mode: 0o644
            }]
        );
    }

    #[test]
    fn dry_run_suppresses_mutating_commands_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_ctx(dir.path(), true);

        // Query still executes for real.
        let out = ctx.run_query(&["echo", "probe"]).unwrap();
        assert_eq!(out.stdout.trim(), "probe");

        // Mutating command is suppressed.
        let out = ctx
            .run_command(&CommandSpec::mutating(&["rm", "-rf", "/nonexistent-target"]))
            .unwrap();
        assert!(out.success());
        assert!(matches!(
            ctx.intended_log().last(),
            Some(IntendedAction::RunCommand { argv }) if argv[0] == "rm"
        ));
    }

    #[test]
    fn command_timeout_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_ctx(dir.path(), false);

        let spec = CommandSpec::query(&["sleep", "5"])
            .with_timeout(std::time::Duration::from_millis(200));
        match ctx.run_command(&spec) {
            Err(HardnError::Timeout { argv, .. }) => assert_eq!(argv[0], "sleep"),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn stdin_bytes_reach_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_ctx(dir.path(), false);

        let spec = CommandSpec::query(&["cat"]).with_stdin(b"y\n".to_vec());
        let out = ctx.run_command(&spec).unwrap();
        assert_eq!(out.stdout, "y\n");
    }

    #[test]
    fn run_lock_rejects_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("backups");
        let mut first = test_ctx(dir.path(), false);
        first.lock_run(&root).unwrap();

        let mut second = test_ctx(dir.path(), false);
        match second.lock_run(&root) {
            Err(HardnError::AlreadyRunning) => {}
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }
}
