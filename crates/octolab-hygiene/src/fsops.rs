use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::HygieneError;
use crate::path::redact_path_under;

/// Create a directory with explicit, owner-only permissions rather than
/// relying on the process umask.
pub fn safe_mkdir(path: &Path, mode: u32) -> Result<(), HygieneError> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

fn chmod_retry_remove(path: &Path, is_dir: bool) -> std::io::Result<()> {
    let mode = if is_dir { 0o700 } else { 0o600 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    if is_dir {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}

/// Best-effort recursive delete of a directory tree that may contain
/// files produced by a container process: root-owned entries, directories
/// with restrictive permissions, or permission bits that block removal.
///
/// Never follows symlinks. On `PermissionError` for a single entry, retries
/// once after a chmod; any remaining failure is logged at basename
/// granularity and otherwise ignored — callers must not depend on deletion
/// succeeding.
pub fn rmtree_hardened(root: &Path) {
    if !root.exists() {
        return;
    }

    let mut entries: Vec<_> = WalkDir::new(root)
        .follow_links(false)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| std::cmp::Reverse(e.depth()));

    for entry in entries {
        let path = entry.path();
        let is_dir = entry.file_type().is_dir();
        let result = if is_dir {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };

        if let Err(err) = result {
            if err.kind() == ErrorKind::NotFound {
                continue;
            }
            if err.kind() == ErrorKind::PermissionDenied {
                if chmod_retry_remove(path, is_dir).is_ok() {
                    continue;
                }
            }
            tracing::debug!(
                entry = %redact_path_under(&path.to_string_lossy(), "<ROOT>", root),
                "rmtree_hardened: failed to remove entry"
            );
        }
    }
}

/// Normalize permissions on a staged evidence tree so the backend process
/// can read everything a container volume produced, regardless of the uid
/// that wrote it.
///
/// Walks the tree without following symlinks; any symlink found is treated
/// as an attempted escape and rejected outright rather than silently
/// skipped. Directories are chmod'd to 0700, files to 0600, best-effort —
/// a chmod failure (root-owned entry) is logged and does not abort the
/// walk.
pub fn normalize_evidence_tree(root: &Path, lab_id: &str) -> Result<(), HygieneError> {
    if !root.exists() {
        return Ok(());
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            HygieneError::Io(std::io::Error::new(ErrorKind::Other, e.to_string()))
        })?;
        let path = entry.path();

        if entry.path_is_symlink() {
            return Err(HygieneError::SymlinkInTree(format!(
                "{} (lab {})",
                redact_path_under(&path.to_string_lossy(), "<EVIDENCE>", root),
                lab_id
            )));
        }

        let mode = if entry.file_type().is_dir() { 0o700 } else { 0o600 };
        if fs::set_permissions(path, fs::Permissions::from_mode(mode)).is_err() {
            tracing::debug!(
                entry = %redact_path_under(&path.to_string_lossy(), "<EVIDENCE>", root),
                lab_id,
                "normalize_evidence_tree: cannot chmod entry"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rmtree_hardened_removes_nested_tree() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("file.txt"), b"evidence").unwrap();

        rmtree_hardened(dir.path());
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn rmtree_hardened_is_noop_on_missing_path() {
        rmtree_hardened(Path::new("/nonexistent/octolab-test-path"));
    }

    #[test]
    fn normalize_evidence_tree_rejects_symlinks() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("real.txt");
        fs::write(&target, b"data").unwrap();
        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let result = normalize_evidence_tree(dir.path(), "lab-test");
        assert!(result.is_err());
    }

    #[test]
    fn normalize_evidence_tree_chmods_plain_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("out.log"), b"log data").unwrap();

        normalize_evidence_tree(dir.path(), "lab-test").unwrap();

        let meta = fs::metadata(dir.path().join("out.log")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
