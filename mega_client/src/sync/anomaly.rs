//! Filename anomaly detection: names that cannot round-trip between the
//! remote tree and the local filesystem are reported to the embedder but
//! never block the operation.

use crate::app::FileNameAnomaly;

/// Reserved device names on Windows-family filesystems; a remote name
/// matching one cannot materialize there.
const RESERVED: &[&str] = &["CON", "PRN", "AUX", "NUL"];

fn is_reserved(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    let upper = stem.to_ascii_uppercase();
    if RESERVED.contains(&upper.as_str()) {
        return true;
    }
    if let Some(rest) = upper.strip_prefix("COM").or_else(|| upper.strip_prefix("LPT"))
        && rest.len() == 1
        && rest.chars().all(|c| c.is_ascii_digit() && c != '0')
    {
        return true;
    }
    false
}

fn has_illegal_chars(name: &str) -> bool {
    name.chars()
        .any(|c| c.is_control() || matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        || name.ends_with('.')
        || name.ends_with(' ')
}

/// Checks the remote name against the local form that materialized for
/// it. Returns the anomaly to report, if any.
pub fn detect(remote_name: &str, local_name: &str) -> Option<FileNameAnomaly> {
    if is_reserved(remote_name) {
        return Some(FileNameAnomaly::NameReserved);
    }
    if has_illegal_chars(remote_name) || remote_name != local_name {
        return Some(FileNameAnomaly::NameMismatch);
    }
    None
}

/// Sanitizes a remote name into something the local filesystem accepts.
pub fn local_form(remote_name: &str) -> String {
    let mut out: String = remote_name
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();
    while out.ends_with('.') || out.ends_with(' ') {
        out.pop();
    }
    if out.is_empty() || is_reserved(&out) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved("CON"));
        assert!(is_reserved("con.txt"));
        assert!(is_reserved("LPT1"));
        assert!(is_reserved("com9.log"));
        assert!(!is_reserved("CONSOLE"));
        assert!(!is_reserved("COM0"));
        assert!(!is_reserved("report"));
    }

    #[test]
    fn test_detect() {
        assert_eq!(detect("a.txt", "a.txt"), None);
        assert_eq!(detect("NUL", "_NUL"), Some(FileNameAnomaly::NameReserved));
        assert_eq!(
            detect("a:b.txt", "a_b.txt"),
            Some(FileNameAnomaly::NameMismatch)
        );
        // Unicode form differences surface as mismatches
        assert_eq!(
            detect("caf\u{00e9}", "cafe\u{0301}"),
            Some(FileNameAnomaly::NameMismatch)
        );
    }

    #[test]
    fn test_local_form() {
        assert_eq!(local_form("a:b*c"), "a_b_c");
        assert_eq!(local_form("trailing. "), "trailing");
        assert_eq!(local_form("CON"), "_CON");
        assert_eq!(local_form("normal.txt"), "normal.txt");
    }
}
