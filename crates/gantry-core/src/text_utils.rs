const TRUNCATION_MARKER: &str = "<output truncated>";

/// Truncates `value` to at most `limit` bytes on a char boundary, appending a marker.
pub fn truncate_utf8(value: &str, limit: usize) -> String {
    if value.len() <= limit {
        return value.to_string();
    }

    if limit == 0 {
        return TRUNCATION_MARKER.to_string();
    }

    let mut end = limit.min(value.len());
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }

    let mut output = value[..end].to_string();
    output.push('\n');
    output.push_str(TRUNCATION_MARKER);
    output
}
