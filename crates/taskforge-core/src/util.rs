use std::sync::OnceLock;

use regex::Regex;

/// Collapse runs of whitespace into single spaces.
pub(crate) fn compact_space(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to at most `max` characters, appending an ellipsis when cut.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max < 4 {
        return text.chars().take(max).collect();
    }
    let head: String = text.chars().take(max - 3).collect();
    format!("{head}...")
}

pub(crate) fn strip_ansi(text: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("static regex"));
    re.replace_all(text, "").into_owned()
}

/// First decimal number embedded in the text, if any.
pub(crate) fn first_number(text: &str) -> Option<u64> {
    static NUM: OnceLock<Regex> = OnceLock::new();
    let re = NUM.get_or_init(|| Regex::new(r"\d+").expect("static regex"));
    re.find(text).and_then(|m| m.as_str().parse().ok())
}
