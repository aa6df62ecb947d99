use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use crate::error::HygieneError;

/// Validate that a string is a well-formed UUID before it is ever used to
/// build a filesystem path or a container/volume name. Every lab-scoped
/// path in this crate starts from a `LabId`, never from raw client input,
/// but this is the seam where a malformed id would otherwise become a
/// path-traversal primitive.
pub fn validate_lab_id(raw: &str) -> Result<Uuid, HygieneError> {
    Uuid::parse_str(raw).map_err(|_| HygieneError::InvalidLabId(redact_path(raw)))
}

/// Reject absolute paths, Windows drive letters, and any `..` component —
/// the same checks the original evidence-extraction code applies before
/// trusting a path taken from inside an archive or a container volume.
pub fn is_safe_relative_path(path: &Path) -> bool {
    if path.is_absolute() {
        return false;
    }
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
            _ => {}
        }
    }
    true
}

/// Join `relative` onto `base` and confirm the result stays under `base`.
/// `relative` must already pass [`is_safe_relative_path`]; this function
/// re-checks independently so callers can't skip the first gate.
pub fn resolve_under_base(base: &Path, relative: &Path) -> Result<PathBuf, HygieneError> {
    if !is_safe_relative_path(relative) {
        return Err(HygieneError::UnsafeRelativePath(redact_path(
            &relative.to_string_lossy(),
        )));
    }
    let joined = base.join(relative);
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(HygieneError::PathEscapesBase(redact_path(
                        &joined.to_string_lossy(),
                    )));
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    if !normalized.starts_with(base) {
        return Err(HygieneError::PathEscapesBase(redact_path(
            &normalized.to_string_lossy(),
        )));
    }
    Ok(normalized)
}

/// Reduce a path to a display form for logging. Invariant: log lines never
/// carry a full filesystem path, since the base directory can leak
/// deployment layout. If `raw` is under `base_dir`, the result is
/// `<base_label>/relative/path`; otherwise it falls back to `.../<basename>`.
pub fn redact_path_under(raw: &str, base_label: &str, base_dir: &Path) -> String {
    let path = Path::new(raw);
    match path.strip_prefix(base_dir) {
        Ok(relative) if !relative.as_os_str().is_empty() => {
            format!("{base_label}/{}", relative.to_string_lossy())
        }
        _ => redact_path(raw),
    }
}

/// [`redact_path_under`] without a known base — always falls back to
/// `.../<basename>`.
pub fn redact_path(raw: &str) -> String {
    Path::new(raw)
        .file_name()
        .map(|n| format!(".../{}", n.to_string_lossy()))
        .unwrap_or_else(|| "<empty>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_uuid() {
        assert!(validate_lab_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
    }

    #[test]
    fn rejects_malformed_uuid() {
        assert!(validate_lab_id("../../etc/passwd").is_err());
    }

    #[test]
    fn rejects_parent_dir_components() {
        assert!(!is_safe_relative_path(Path::new("../escape")));
        assert!(!is_safe_relative_path(Path::new("a/../../b")));
        assert!(is_safe_relative_path(Path::new("a/b/c.log")));
    }

    #[test]
    fn resolve_under_base_rejects_traversal() {
        let base = Path::new("/var/lib/octolab/evidence/lab-1");
        assert!(resolve_under_base(base, Path::new("../lab-2/secret")).is_err());
        assert!(resolve_under_base(base, Path::new("pcap/session.pcap")).is_ok());
    }

    #[test]
    fn redact_path_strips_directory_components() {
        assert_eq!(
            redact_path("/var/lib/octolab/evidence/lab-1/pcap.log"),
            ".../pcap.log"
        );
    }

    #[test]
    fn redact_path_under_keeps_relative_form_inside_base() {
        let base = Path::new("/var/lib/octolab/evidence/lab-1");
        let full = "/var/lib/octolab/evidence/lab-1/pcap/session.pcap";
        assert_eq!(
            redact_path_under(full, "<EVIDENCE>", base),
            "<EVIDENCE>/pcap/session.pcap"
        );
    }

    #[test]
    fn redact_path_under_falls_back_outside_base() {
        let base = Path::new("/var/lib/octolab/evidence/lab-1");
        let outside = "/etc/passwd";
        assert_eq!(redact_path_under(outside, "<EVIDENCE>", base), ".../passwd");
    }
}
