use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};

use crate::core::error::{HardnError, HardnResult};
use crate::execution::backup::BackupRecord;
use crate::execution::context::{
    CommandOutput, CommandSpec, ExecutionContext, FileInfo, IntendedAction, Owner, ServiceStatus,
};
use crate::utils::paths::escape_for_backup;

/// In-memory file entry.
#[derive(Debug, Clone)]
struct MemFile {
    bytes: Vec<u8>,
    mode: u32,
    owner: Owner,
}

/// A scripted subprocess response. Later scripts shadow earlier ones for
/// the same argv, so tests can change a command's answer between runs.
#[derive(Debug, Clone)]
struct ScriptedCommand {
    argv: Vec<String>,
    output: CommandOutput,
}

/// Record of an issued subprocess, kept for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RanCommand {
    pub argv: Vec<String>,
    pub mutating: bool,
}

/// In-memory execution context used by the test suite.
///
/// Beyond a fake filesystem and scripted commands it carries a small host
/// emulation (user database edits for `useradd`/`usermod`, a package set for
/// `apt-get install`/`apk add`, and UFW rule state) so multi-run scenarios
/// observe their own effects the way a real host would.
pub struct MemoryContext {
    dry_run: bool,
    files: BTreeMap<PathBuf, MemFile>,
    dirs: BTreeMap<PathBuf, u32>,
    symlinks: BTreeMap<PathBuf, PathBuf>,
    scripts: Vec<ScriptedCommand>,
    pub commands_run: Vec<RanCommand>,
    services: BTreeMap<String, ServiceStatus>,
    intended: Vec<IntendedAction>,
    pub backups: Vec<BackupRecord>,
    packages: HashSet<String>,
    ufw_active: bool,
    ufw_default_deny: bool,
    ufw_rules: Vec<String>,
    subnets: Vec<String>,
    backup_root: PathBuf,
    run_id: String,
    seq: u64,
    lock_held_elsewhere: bool,
    now: DateTime<Utc>,
}

impl Default for MemoryContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryContext {
    pub fn new() -> Self {
        Self {
            dry_run: false,
            files: BTreeMap::new(),
            dirs: BTreeMap::new(),
            symlinks: BTreeMap::new(),
            scripts: Vec::new(),
            commands_run: Vec::new(),
            services: BTreeMap::new(),
            intended: Vec::new(),
            backups: Vec::new(),
            packages: HashSet::new(),
            ufw_active: false,
            ufw_default_deny: false,
            ufw_rules: Vec::new(),
            subnets: vec!["192.168.1.0/24".to_string()],
            backup_root: PathBuf::from("/var/lib/hardn/backups"),
            run_id: "20250115-120000-aa".to_string(),
            seq: 0,
            lock_held_elsewhere: false,
            now: Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap(),
        }
    }

    // -- seeding --

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    pub fn seed_file(&mut self, path: impl AsRef<Path>, content: &str) {
        self.seed_file_mode(path, content, 0o644);
    }

    pub fn seed_file_mode(&mut self, path: impl AsRef<Path>, content: &str, mode: u32) {
        self.files.insert(
            path.as_ref().to_path_buf(),
            MemFile {
                bytes: content.as_bytes().to_vec(),
                mode,
                owner: Owner::Root,
            },
        );
    }

    pub fn seed_dir(&mut self, path: impl AsRef<Path>) {
        self.dirs.insert(path.as_ref().to_path_buf(), 0o755);
    }

    pub fn seed_symlink(&mut self, path: impl AsRef<Path>, target: impl AsRef<Path>) {
        self.symlinks.insert(
            path.as_ref().to_path_buf(),
            target.as_ref().to_path_buf(),
        );
    }

    pub fn seed_service(&mut self, unit: &str, present: bool, active: bool, enabled: bool) {
        self.services.insert(
            unit.to_string(),
            ServiceStatus {
                present,
                active,
                enabled,
            },
        );
    }

    pub fn seed_package(&mut self, name: &str) {
        self.packages.insert(name.to_string());
    }

    pub fn script_command(&mut self, argv: &[&str], exit: i32, stdout: &str, stderr: &str) {
        self.scripts.push(ScriptedCommand {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            output: CommandOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit,
            },
        });
    }

    pub fn hold_lock_elsewhere(&mut self) {
        self.lock_held_elsewhere = true;
    }

    // -- assertions --

    pub fn file_string(&self, path: impl AsRef<Path>) -> Option<String> {
        self.files
            .get(path.as_ref())
            .map(|f| String::from_utf8_lossy(&f.bytes).to_string())
    }

    pub fn file_mode(&self, path: impl AsRef<Path>) -> Option<u32> {
        self.files.get(path.as_ref()).map(|f| f.mode)
    }

    pub fn file_owner(&self, path: impl AsRef<Path>) -> Option<Owner> {
        self.files.get(path.as_ref()).map(|f| f.owner.clone())
    }

    pub fn has_dir(&self, path: impl AsRef<Path>) -> bool {
        self.dirs.contains_key(path.as_ref())
    }

    pub fn mutating_commands_run(&self) -> Vec<&RanCommand> {
        self.commands_run.iter().filter(|c| c.mutating).collect()
    }

    /// Full snapshot of file paths and contents, for before/after diffing.
    pub fn fs_snapshot(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        self.files
            .iter()
            .map(|(p, f)| (p.clone(), f.bytes.clone()))
            .collect()
    }

    pub fn ufw_is_active(&self) -> bool {
        self.ufw_active
    }

    pub fn ufw_rule_list(&self) -> &[String] {
        &self.ufw_rules
    }

    pub fn package_installed(&self, name: &str) -> bool {
        self.packages.contains(name)
    }

    // -- emulation --

    fn emulate(&mut self, argv: &[String]) -> CommandOutput {
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["uname", "-r"] => CommandOutput {
                stdout: "6.1.0-test\n".into(),
                ..Default::default()
            },
            ["dpkg-query", "-W", "-f", "${Status}", pkg] => {
                if self.packages.contains(*pkg) {
                    CommandOutput {
                        stdout: "install ok installed".into(),
                        ..Default::default()
                    }
                } else {
                    CommandOutput {
                        exit: 1,
                        stderr: format!("dpkg-query: no packages found matching {pkg}"),
                        ..Default::default()
                    }
                }
            }
            ["apk", "info", "-e", pkg] => {
                if self.packages.contains(*pkg) {
                    CommandOutput {
                        stdout: format!("{pkg}\n"),
                        ..Default::default()
                    }
                } else {
                    CommandOutput {
                        exit: 1,
                        ..Default::default()
                    }
                }
            }
            ["apt-get", "install", "-y", rest @ ..] | ["apk", "add", rest @ ..] => {
                for pkg in rest {
                    self.packages.insert((*pkg).to_string());
                }
                CommandOutput::default()
            }
            ["apt-get", "update"] | ["apk", "update"] => CommandOutput::default(),
            ["useradd", "-m", "-s", shell, user] | ["adduser", "-D", "-s", shell, user] => {
                self.append_passwd_entry(user, shell);
                CommandOutput::default()
            }
            ["usermod", "-aG", group, user] | ["addgroup", user, group] => {
                self.append_group_member(group, user);
                CommandOutput::default()
            }
            ["visudo", "-cf", _] => CommandOutput {
                stdout: "parsed OK\n".into(),
                ..Default::default()
            },
            ["ufw", rest @ ..] => self.emulate_ufw(rest),
            _ => CommandOutput::default(),
        }
    }

    fn emulate_ufw(&mut self, args: &[&str]) -> CommandOutput {
        match args {
            ["--version"] => CommandOutput {
                stdout: "ufw 0.36.2\nCopyright 2008-2023 Canonical Ltd.\n".into(),
                ..Default::default()
            },
            ["status", "verbose"] | ["status"] => {
                let mut out = String::new();
                if self.ufw_active {
                    out.push_str("Status: active\n");
                    if self.ufw_default_deny {
                        out.push_str(
                            "Default: deny (incoming), allow (outgoing), disabled (routed)\n",
                        );
                    } else {
                        out.push_str(
                            "Default: allow (incoming), allow (outgoing), disabled (routed)\n",
                        );
                    }
                    out.push_str("\nTo                         Action      From\n");
                    out.push_str("--                         ------      ----\n");
                    for rule in &self.ufw_rules {
                        out.push_str(&format!("{:<26} ALLOW IN    Anywhere\n", rule));
                    }
                } else {
                    out.push_str("Status: inactive\n");
                }
                CommandOutput {
                    stdout: out,
                    ..Default::default()
                }
            }
            ["default", "deny", "incoming"] => {
                self.ufw_default_deny = true;
                CommandOutput::default()
            }
            ["default", "allow", "outgoing"] => CommandOutput::default(),
            ["allow", spec] => {
                if !self.ufw_rules.iter().any(|r| r == spec) {
                    self.ufw_rules.push((*spec).to_string());
                }
                CommandOutput::default()
            }
            ["--force", "enable"] | ["enable"] => {
                self.ufw_active = true;
                CommandOutput {
                    stdout: "Firewall is active and enabled on system startup\n".into(),
                    ..Default::default()
                }
            }
            _ => CommandOutput::default(),
        }
    }

    fn append_passwd_entry(&mut self, user: &str, shell: &str) {
        let path = PathBuf::from("/etc/passwd");
        let mut content = self
            .files
            .get(&path)
            .map(|f| String::from_utf8_lossy(&f.bytes).to_string())
            .unwrap_or_default();
        let next_uid = 1000
            + content
                .lines()
                .filter_map(|l| l.split(':').nth(2))
                .filter_map(|u| u.parse::<u32>().ok())
                .filter(|u| (1000..60000).contains(u))
                .count() as u32;
        content.push_str(&format!(
            "{user}:x:{next_uid}:{next_uid}::/home/{user}:{shell}\n"
        ));
        self.files.insert(
            path,
            MemFile {
                bytes: content.into_bytes(),
                mode: 0o644,
                owner: Owner::Root,
            },
        );
        self.dirs.insert(PathBuf::from(format!("/home/{user}")), 0o755);
    }

    fn append_group_member(&mut self, group: &str, user: &str) {
        let path = PathBuf::from("/etc/group");
        let mut lines: Vec<String> = self
            .files
            .get(&path)
            .map(|f| {
                String::from_utf8_lossy(&f.bytes)
                    .lines()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let mut found = false;
        for line in &mut lines {
            if line.starts_with(&format!("{group}:")) {
                found = true;
                if line.ends_with(':') {
                    line.push_str(user);
                } else if !line
                    .rsplit(':')
                    .next()
                    .unwrap_or("")
                    .split(',')
                    .any(|m| m == user)
                {
                    line.push(',');
                    line.push_str(user);
                }
            }
        }
        if !found {
            lines.push(format!("{group}:x:27:{user}"));
        }
        let mut content = lines.join("\n");
        content.push('\n');
        self.files.insert(
            path,
            MemFile {
                bytes: content.into_bytes(),
                mode: 0o644,
                owner: Owner::Root,
            },
        );
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match self.symlinks.get(path) {
            Some(target) => target.clone(),
            None => path.to_path_buf(),
        }
    }
}

impl ExecutionContext for MemoryContext {
    fn dry_run(&self) -> bool {
        self.dry_run
    }

    fn read_file(&mut self, path: &Path) -> HardnResult<Vec<u8>> {
        let resolved = self.resolve(path);
        match self.files.get(&resolved) {
            Some(f) => Ok(f.bytes.clone()),
            None => Err(HardnError::io(
                path,
                "read",
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            )),
        }
    }

    fn stat(&mut self, path: &Path) -> Option<FileInfo> {
        if let Some(target) = self.symlinks.get(path) {
            return Some(FileInfo {
                is_dir: false,
                is_symlink: true,
                symlink_target: Some(target.clone()),
                mode: 0o777,
            });
        }
        if let Some(mode) = self.dirs.get(path) {
            return Some(FileInfo {
                is_dir: true,
                is_symlink: false,
                symlink_target: None,
                mode: *mode,
            });
        }
        self.files.get(path).map(|f| FileInfo {
            is_dir: false,
            is_symlink: false,
            symlink_target: None,
            mode: f.mode,
        })
    }

    fn list_dir(&mut self, path: &Path) -> Vec<PathBuf> {
        let mut entries: Vec<PathBuf> = self
            .files
            .keys()
            .chain(self.dirs.keys())
            .chain(self.symlinks.keys())
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect();
        entries.sort();
        entries.dedup();
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
            return Ok(BackupRecord::synthetic(path, &self.run_id, self.now));
        }

        let mut record = BackupRecord::synthetic(path, &self.run_id, self.now);

        // Rename-over semantics: a symlink at the target is replaced by a
        // regular file; the backup keeps the link target as text.
        if let Some(target) = self.symlinks.remove(path) {
            self.seq += 1;
            let copy_path = self
                .backup_root
                .join(&self.run_id)
                .join(format!("{}.{}", escape_for_backup(path), self.seq));
            self.files.insert(
                copy_path.clone(),
                MemFile {
                    bytes: target.to_string_lossy().into_owned().into_bytes(),
                    mode: 0o600,
                    owner: Owner::Root,
                },
            );
            record.copy_path = copy_path;
            record.original_mode = 0o777;
        } else if let Some(existing) = self.files.get(path).cloned() {
            self.seq += 1;
            let copy_path = self
                .backup_root
                .join(&self.run_id)
                .join(format!("{}.{}", escape_for_backup(path), self.seq));
            self.files.insert(
                copy_path.clone(),
                MemFile {
                    bytes: existing.bytes.clone(),
                    mode: existing.mode,
                    owner: existing.owner.clone(),
                },
            );
            record.copy_path = copy_path;
            record.original_mode = existing.mode;
        }

        self.files.insert(
            path.to_path_buf(),
            MemFile {
                bytes: bytes.to_vec(),
                mode,
                owner,
            },
        );
        self.backups.push(record.clone());
        Ok(record)
    }

    fn ensure_dir(&mut self, path: &Path, mode: u32, _owner: Owner) -> HardnResult<()> {
        if self.dry_run {
            if !self.dirs.contains_key(path) {
                self.intended.push(IntendedAction::EnsureDir {
                    path: path.to_path_buf(),
                    mode,
                });
            }
            return Ok(());
        }
        self.dirs.entry(path.to_path_buf()).or_insert(mode);
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

        self.commands_run.push(RanCommand {
            argv: spec.argv.clone(),
            mutating: spec.mutating,
        });

        // Explicit scripts shadow the built-in emulation, newest first.
        if let Some(scripted) = self
            .scripts
            .iter()
            .rev()
            .find(|s| s.argv == spec.argv)
            .cloned()
        {
            return Ok(scripted.output);
        }

        Ok(self.emulate(&spec.argv))
    }

    fn query_service(&mut self, unit: &str) -> ServiceStatus {
        self.services.get(unit).copied().unwrap_or_default()
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
        let entry = self.services.entry(unit.to_string()).or_insert(ServiceStatus {
            present: true,
            active: false,
            enabled: false,
        });
        if let Some(on) = active {
            entry.active = on;
        }
        if let Some(on) = enabled {
            entry.enabled = on;
        }
        Ok(())
    }

    fn local_subnets(&mut self) -> Vec<String> {
        self.subnets.clone()
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn lock_run(&mut self, _backup_root: &Path) -> HardnResult<()> {
        if self.lock_held_elsewhere {
            return Err(HardnError::AlreadyRunning);
        }
        Ok(())
    }

    fn intended_log(&self) -> &[IntendedAction] {
        &self.intended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn useradd_emulation_updates_passwd() {
        let mut ctx = MemoryContext::new();
        ctx.seed_file("/etc/passwd", "root:x:0:0:root:/root:/bin/bash\n");

        ctx.run_command(&CommandSpec::mutating(&[
            "useradd", "-m", "-s", "/bin/bash", "ops",
        ]))
        .unwrap();

        let passwd = ctx.file_string("/etc/passwd").unwrap();
        assert!(passwd.contains("ops:x:1000:1000::/home/ops:/bin/bash"));
        assert!(ctx.has_dir("/home/ops"));
    }

    #[test]
    fn ufw_emulation_tracks_rules_and_activation() {
        let mut ctx = MemoryContext::new();
        ctx.run_command(&CommandSpec::mutating(&["ufw", "allow", "2222/tcp"]))
            .unwrap();
        ctx.run_command(&CommandSpec::mutating(&["ufw", "--force", "enable"]))
            .unwrap();

        assert!(ctx.ufw_is_active());
        let status = ctx.run_query(&["ufw", "status", "verbose"]).unwrap();
        assert!(status.stdout.contains("Status: active"));
        assert!(status.stdout.contains("2222/tcp"));
    }

    #[test]
    fn symlink_write_replaces_link_and_backs_up_target() {
        let mut ctx = MemoryContext::new();
        ctx.seed_symlink("/etc/resolv.conf", "/run/systemd/resolve/stub-resolv.conf");

        let record = ctx
            .write_file_atomic(
                "/etc/resolv.conf".as_ref(),
                b"nameserver 1.1.1.1\n",
                0o644,
                Owner::Root,
            )
            .unwrap();

        assert!(!record.copy_path.as_os_str().is_empty());
        let preserved = ctx.file_string(&record.copy_path).unwrap();
        assert_eq!(preserved, "/run/systemd/resolve/stub-resolv.conf");
        let info = ctx.stat("/etc/resolv.conf".as_ref()).unwrap();
        assert!(!info.is_symlink);
    }

    #[test]
    fn scripts_shadow_emulation() {
        let mut ctx = MemoryContext::new();
        ctx.script_command(&["visudo", "-cf", "/tmp/x"], 1, "", "syntax error near line 1");

        let out = ctx.run_query(&["visudo", "-cf", "/tmp/x"]).unwrap();
        assert_eq!(out.exit, 1);
    }

    #[test]
    fn dry_run_records_intent_without_state_change() {
        let mut ctx = MemoryContext::new();
        ctx.seed_file("/etc/motd", "hello\n");
        ctx.set_dry_run(true);

        let before = ctx.fs_snapshot();
        ctx.write_file_atomic("/etc/motd".as_ref(), b"pwned\n", 0o644, Owner::Root)
            .unwrap();
        ctx.run_command(&CommandSpec::mutating(&["apt-get", "update"]))
            .unwrap();

        assert_eq!(before, ctx.fs_snapshot());
        assert!(ctx.commands_run.is_empty());
        assert_eq!(ctx.intended_log().len(), 2);
    }
}
