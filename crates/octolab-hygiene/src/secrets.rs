use std::sync::OnceLock;

use regex::Regex;

/// Patterns matched against subprocess output and stored log/event payloads
/// before they are persisted or returned over the API. Each pattern keeps
/// the key/label and blanks the value.
fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r#"(?i)(password|passwd|pwd)\s*[:=]\s*\S+"#).unwrap(),
            Regex::new(r#"(?i)(token|secret|api[_-]?key)\s*[:=]\s*\S+"#).unwrap(),
            Regex::new(r#"(?i)(authorization)\s*:\s*\S+"#).unwrap(),
            Regex::new(r#"postgres(?:ql)?://[^:\s]+:[^@\s]+@"#).unwrap(),
        ]
    })
}

/// Redact anything that looks like a credential from subprocess output or
/// request intent blobs before they go into evidence, logs, or API
/// responses. Best-effort: this is defense in depth, not the primary
/// control — `runtime_meta` and `requested_intent` should never carry raw
/// secrets in the first place.
pub fn redact_secrets(input: &str) -> String {
    let mut out = input.to_string();
    for pattern in patterns() {
        out = pattern
            .replace_all(&out, |caps: &regex::Captures| {
                if let Some(label) = caps.get(1) {
                    format!("{}=***REDACTED***", label.as_str())
                } else {
                    "***REDACTED***".to_string()
                }
            })
            .into_owned();
    }
    out
}

/// Truncate long text for storage/display, keeping a head and tail slice
/// with a marker noting how much was dropped. Cut points are walked back
/// to the nearest char boundary so multi-byte UTF-8 in subprocess output
/// never causes a slicing panic.
pub fn truncate(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let half = max_len / 2;
    let head_end = floor_char_boundary(input, half);
    let tail_start = ceil_char_boundary(input, input.len() - half);
    let dropped = tail_start.saturating_sub(head_end);
    format!(
        "{}\n...[{} bytes truncated]...\n{}",
        &input[..head_end],
        dropped,
        &input[tail_start..]
    )
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_password_assignment() {
        let out = redact_secrets("DB_PASSWORD=hunter2 ready");
        assert!(!out.contains("hunter2"));
    }

    #[test]
    fn redacts_connection_string_credentials() {
        let out = redact_secrets("connecting to postgres://user:s3cret@db:5432/octolab");
        assert!(!out.contains("s3cret"));
    }

    #[test]
    fn leaves_ordinary_output_untouched() {
        let out = "container started on port 5901";
        assert_eq!(redact_secrets(out), out);
    }

    #[test]
    fn truncate_keeps_head_and_tail() {
        let long = "a".repeat(1000);
        let out = truncate(&long, 100);
        assert!(out.len() < long.len());
        assert!(out.starts_with("aaaa"));
        assert!(out.contains("truncated"));
    }

    #[test]
    fn truncate_is_noop_under_limit() {
        assert_eq!(truncate("short", 100), "short");
    }

    #[test]
    fn truncate_does_not_split_multibyte_chars() {
        let long = "\u{1F980}".repeat(200); // 4-byte emoji, 800 bytes total
        let out = truncate(&long, 101);
        assert!(out.contains("truncated"));
    }
}
