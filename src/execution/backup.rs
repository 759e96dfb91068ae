use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{HardnError, HardnResult};
use crate::utils::paths::escape_for_backup;

/// One pre-mutation copy. Flushed to the manifest as soon as it is taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    /// Empty under dry-run (synthetic record) or when the target did not
    /// exist before the write.
    pub copy_path: PathBuf,
    pub original_mode: u32,
    /// uid:gid of the original, when it existed.
    pub original_owner: Option<(u32, u32)>,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
}

impl BackupRecord {
    /// Record for a write that had nothing to preserve (new file, or any
    /// write under dry-run).
    pub fn synthetic(path: &Path, run_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            original_path: path.to_path_buf(),
            copy_path: PathBuf::new(),
            original_mode: 0,
            original_owner: None,
            timestamp: now,
            run_id: run_id.to_string(),
        }
    }
}

/// Append-only store of pre-mutation copies for a single engine run.
///
/// Layout: `<root>/<runId>/<escaped-original-path>.<seq>` plus a
/// `manifest.jsonl` of [`BackupRecord`]s. Backups are never deleted by this
/// system.
pub struct BackupStore {
    root: PathBuf,
    run_id: String,
    seq: u64,
    run_dir_created: bool,
}

impl BackupStore {
    /// Choose a fresh run id under `root`. The directory itself is created
    /// lazily on the first backup.
    pub fn new(root: PathBuf, now: DateTime<Utc>) -> Self {
        let stamp = now.format("%Y%m%d-%H%M%S");
        let nanos = now.timestamp_subsec_nanos();
        let mut suffix = (nanos & 0xff) as u16;
        let mut run_id = format!("{stamp}-{suffix:02x}");
        // Collisions are recovered by bumping the suffix until a free
        // directory name is found.
        while root.join(&run_id).exists() {
            suffix = suffix.wrapping_add(1);
            run_id = format!("{stamp}-{suffix:02x}");
        }
        Self {
            root,
            run_id,
            seq: 0,
            run_dir_created: false,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(&self.run_id)
    }

    fn ensure_run_dir(&mut self) -> HardnResult<()> {
        if self.run_dir_created {
            return Ok(());
        }
        let dir = self.run_dir();
        fs::create_dir_all(&dir).map_err(|e| HardnError::io(&dir, "create_dir", e))?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| HardnError::io(&dir, "chmod", e))?;
        self.run_dir_created = true;
        Ok(())
    }

    /// Copy `original` byte-for-byte before it gets overwritten, preserving
    /// mode and ownership on the copy.
    pub fn preserve(&mut self, original: &Path, now: DateTime<Utc>) -> HardnResult<BackupRecord> {
        self.ensure_run_dir()?;

        let meta = fs::symlink_metadata(original)
            .map_err(|e| HardnError::io(original, "stat", e))?;
        self.seq += 1;
        let name = format!("{}.{}", escape_for_backup(original), self.seq);
        let copy_path = self.run_dir().join(name);

        if meta.file_type().is_symlink() {
            // Preserve the link target as text; the record notes the
            // original was a symlink via the copy contents.
            let target = fs::read_link(original)
                .map_err(|e| HardnError::io(original, "readlink", e))?;
            fs::write(&copy_path, target.to_string_lossy().as_bytes())
                .map_err(|e| HardnError::io(&copy_path, "write", e))?;
        } else {
            fs::copy(original, &copy_path)
                .map_err(|e| HardnError::io(&copy_path, "copy", e))?;
            fs::set_permissions(&copy_path, fs::Permissions::from_mode(meta.mode() & 0o7777))
                .map_err(|e| HardnError::io(&copy_path, "chmod", e))?;
        }

        let record = BackupRecord {
            original_path: original.to_path_buf(),
            copy_path,
            original_mode: meta.mode() & 0o7777,
            original_owner: Some((meta.uid(), meta.gid())),
            timestamp: now,
            run_id: self.run_id.clone(),
        };
        self.append_manifest(&record)?;
        Ok(record)
    }

    fn append_manifest(&self, record: &BackupRecord) -> HardnResult<()> {
        use std::io::Write;
        let manifest = self.run_dir().join("manifest.jsonl");
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&manifest)
            .map_err(|e| HardnError::io(&manifest, "open", e))?;
        let line = serde_json::to_string(record)
            .map_err(|e| HardnError::io(&manifest, "serialize", std::io::Error::other(e)))?;
        writeln!(f, "{line}").map_err(|e| HardnError::io(&manifest, "write", e))?;
        Ok(())
    }
}
