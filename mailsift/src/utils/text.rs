//! Text helpers.

/// Marker appended to bodies cut down to fit an upstream size limit.
pub const TRUNCATION_MARKER: &str = "\n...[truncated]";

/// Shrink `text` to roughly `factor` of its length, on a char boundary.
///
/// Returns `None` when nothing can be removed (empty text or a factor that
/// would not shorten it).
pub fn shrink_to_fraction(text: &str, factor: f64) -> Option<String> {
    let stripped = text.strip_suffix(TRUNCATION_MARKER).unwrap_or(text);
    if stripped.is_empty() {
        return None;
    }

    let mut cut = ((stripped.len() as f64) * factor.clamp(0.0, 1.0)) as usize;
    if cut >= stripped.len() {
        return None;
    }
    while cut > 0 && !stripped.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
    out.push_str(&stripped[..cut]);
    out.push_str(TRUNCATION_MARKER);
    Some(out)
}

/// First `max_chars` characters of `text`, for log lines and events.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
