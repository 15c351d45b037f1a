//! Bounding captured process output.

/// Characters of output included in log lines.
pub const LOG_PREVIEW_CHARS: usize = 500;

const TRUNCATED_MARKER: &str = "…[truncated]";

/// Cut `text` to at most `max_bytes` on a char boundary, appending a marker
/// when anything was dropped.
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{TRUNCATED_MARKER}", &text[..end])
}

/// First [`LOG_PREVIEW_CHARS`] characters of `text`, for logging.
pub fn preview(text: &str) -> &str {
    match text.char_indices().nth(LOG_PREVIEW_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
