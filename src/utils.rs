//! Common utility functions used across modules.
//!
//! - [`truncate`] - Truncate strings with ellipsis
//! - [`payload_preview`] - Printable, bounded rendering of an inbound payload

/// Longest payload excerpt written to the log.
pub const PREVIEW_LEN: usize = 256;

/// Truncate a string to at most `max_len` bytes, adding "..." if truncated.
///
/// Cuts on a char boundary, so multi-byte input never panics.
///
/// # Examples
/// ```
/// use curfew::utils::truncate;
/// assert_eq!(truncate("short", 10), "short");
/// assert_eq!(truncate("this is long", 10), "this is...");
/// ```
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    if max_len <= 3 {
        return "...".to_string();
    }

    let mut end = max_len - 3;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Render raw payload bytes for a log line: lossy UTF-8, control
/// characters escaped, bounded length.
pub fn payload_preview(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    let escaped: String = text.chars().flat_map(char::escape_default).collect();
    truncate(&escaped, PREVIEW_LEN)
}
