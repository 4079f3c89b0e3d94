/// Longest title or preview line kept, in code points.
pub const SUMMARY_LINE_CHARS: usize = 100;

pub const UNTITLED: &str = "Untitled";

/// Truncate a string to at most `max` characters.
/// Handles multi-byte (CJK) correctly via char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Title is the first non-blank line, preview the next non-blank line after it.
/// Both are trimmed and capped at [`SUMMARY_LINE_CHARS`].
pub fn derive_title_preview(content: &str) -> (String, String) {
    let mut lines = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty());

    let title = lines
        .next()
        .map(|l| truncate_chars(l, SUMMARY_LINE_CHARS))
        .unwrap_or_else(|| UNTITLED.to_string());
    let preview = lines
        .next()
        .map(|l| truncate_chars(l, SUMMARY_LINE_CHARS))
        .unwrap_or_default();

    (title, preview)
}

pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
