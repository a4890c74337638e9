//! Text helpers shared by prompts, parsers and logs.

/// Remove a surrounding markdown code fence, if any.
///
/// Backends frequently wrap file content in ```` ```lang ```` fences even
/// when asked not to. Only a fence that opens the text is removed; inner
/// fences are left alone.
pub fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let mut lines: Vec<&str> = trimmed.lines().collect();
    lines.remove(0);
    if lines.last().map(|l| l.trim_start().starts_with("```")) == Some(true) {
        lines.pop();
    }
    lines.join("\n")
}

/// Extract the outermost JSON object from free text.
///
/// Tries the fence-stripped text first, then the slice from the first `{`
/// to the last `}`.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let stripped = strip_fences(text);
    if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(&stripped) {
        return Some(value);
    }

    let start = stripped.find('{')?;
    let end = stripped.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&stripped[start..=end]) {
        Ok(value @ serde_json::Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// First `max_chars` characters of `text`.
pub fn head_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    match text.char_indices().nth(count - max_chars) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Module stem of a project path: `app/models/user.py` -> `user`.
pub fn path_stem(path: &str) -> &str {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
    match file.rfind('.') {
        Some(0) | None => file,
        Some(idx) => &file[..idx],
    }
}
