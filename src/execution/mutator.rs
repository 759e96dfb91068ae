use std::path::Path;

use crate::core::config::MANAGED_HEADER;
use crate::core::error::HardnResult;
use crate::execution::backup::BackupRecord;
use crate::execution::context::{ExecutionContext, Owner};

/// Default modes: plain config, key material, sudoers fragments.
pub const MODE_CONFIG: u32 = 0o644;
pub const MODE_SECRET: u32 = 0o600;
pub const MODE_SUDOERS: u32 = 0o440;

/// Outcome of an idempotent mutation.
#[derive(Debug)]
pub enum MutationOutcome {
    /// Target already matched the desired state; nothing written.
    Unchanged,
    Written(BackupRecord),
}

impl MutationOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, MutationOutcome::Written(_))
    }

    pub fn backup(self) -> Option<BackupRecord> {
        match self {
            MutationOutcome::Written(record) if !record.copy_path.as_os_str().is_empty() => {
                Some(record)
            }
            _ => None,
        }
    }
}

/// Replace the value of `key` on the first uncommented logical line that
/// carries it, or append `key value` when absent. Keyword comparison is
/// case-insensitive, matching sshd_config semantics. Unrelated lines are
/// left byte-identical.
pub fn replace_directive(
    ctx: &mut dyn ExecutionContext,
    path: &Path,
    key: &str,
    value: &str,
) -> HardnResult<MutationOutcome> {
    let existing = ctx.read_to_string(path).unwrap_or_default();
    let had_trailing_newline = existing.is_empty() || existing.ends_with('\n');

    let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();
    let mut replaced = false;
    for line in &mut lines {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            continue;
        }
        let mut tokens = trimmed.split_whitespace();
        if tokens
            .next()
            .is_some_and(|k| k.eq_ignore_ascii_case(key))
        {
            *line = format!("{key} {value}");
            replaced = true;
            break;
        }
    }
    if !replaced {
        lines.push(format!("{key} {value}"));
    }

    let mut desired = lines.join("\n");
    if had_trailing_newline || !replaced {
        desired.push('\n');
    }
    if desired == existing {
        return Ok(MutationOutcome::Unchanged);
    }

    let mode = ctx.stat(path).map(|i| i.mode).unwrap_or(MODE_CONFIG);
    let record = ctx.write_file_atomic(path, desired.as_bytes(), mode, Owner::KeepExisting)?;
    Ok(MutationOutcome::Written(record))
}

/// Idempotent full-file replacement with the fixed managed header.
pub fn write_managed_file(
    ctx: &mut dyn ExecutionContext,
    path: &Path,
    content: &str,
    mode: u32,
    owner: Owner,
) -> HardnResult<MutationOutcome> {
    let mut desired = String::with_capacity(MANAGED_HEADER.len() + 1 + content.len());
    desired.push_str(MANAGED_HEADER);
    desired.push('\n');
    desired.push_str(content);
    if !desired.ends_with('\n') {
        desired.push('\n');
    }

    if ctx.read_to_string(path).as_deref() == Some(desired.as_str()) {
        return Ok(MutationOutcome::Unchanged);
    }

    let record = ctx.write_file_atomic(path, desired.as_bytes(), mode, owner)?;
    Ok(MutationOutcome::Written(record))
}

/// Append `line` unless an exact (post-trim) match already exists.
pub fn ensure_line_in_file(
    ctx: &mut dyn ExecutionContext,
    path: &Path,
    line: &str,
) -> HardnResult<MutationOutcome> {
    let existing = ctx.read_to_string(path).unwrap_or_default();
    if existing.lines().any(|l| l.trim() == line.trim()) {
        return Ok(MutationOutcome::Unchanged);
    }

    let mut desired = existing.clone();
    if !desired.is_empty() && !desired.ends_with('\n') {
        desired.push('\n');
    }
    desired.push_str(line);
    desired.push('\n');

    let mode = ctx.stat(path).map(|i| i.mode).unwrap_or(MODE_CONFIG);
    let record = ctx.write_file_atomic(path, desired.as_bytes(), mode, Owner::KeepExisting)?;
    Ok(MutationOutcome::Written(record))
}

/// Drop every line the predicate matches; no-op when nothing matches.
pub fn remove_lines_matching(
    ctx: &mut dyn ExecutionContext,
    path: &Path,
    predicate: impl Fn(&str) -> bool,
) -> HardnResult<MutationOutcome> {
    let Some(existing) = ctx.read_to_string(path) else {
        return Ok(MutationOutcome::Unchanged);
    };

    let kept: Vec<&str> = existing.lines().filter(|l| !predicate(l)).collect();
    let mut desired = kept.join("\n");
    if existing.ends_with('\n') && !desired.is_empty() {
        desired.push('\n');
    }
    if desired == existing {
        return Ok(MutationOutcome::Unchanged);
    }

    let mode = ctx.stat(path).map(|i| i.mode).unwrap_or(MODE_CONFIG);
    let record = ctx.write_file_atomic(path, desired.as_bytes(), mode, Owner::KeepExisting)?;
    Ok(MutationOutcome::Written(record))
}
