use std::path::Path;

/// Escape an absolute path into a single backup file name component.
/// Only '/' and the escape character itself are rewritten, so the original
/// path stays recoverable by inspection.
pub fn escape_for_backup(path: &Path) -> String {
    let mut out = String::new();
    for ch in path.to_string_lossy().chars() {
        match ch {
            '/' => out.push_str("%2F"),
            '%' => out.push_str("%25"),
            other => out.push(other),
        }
    }
    out.trim_start_matches("%2F").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn escapes_slashes_and_percent() {
        assert_eq!(
            escape_for_backup(&PathBuf::from("/etc/ssh/sshd_config")),
            "etc%2Fssh%2Fsshd_config"
        );
        assert_eq!(
            escape_for_backup(&PathBuf::from("/tmp/50%.conf")),
            "tmp%2F50%25.conf"
        );
    }
}
