//! Common utility functions used across the codebase.

/// Truncates a string to at most `max_chars` characters, adding "..." if truncated.
///
/// UTF-8 safe: counts characters, not bytes, so multi-byte input (emojis,
/// CJK) never panics at a boundary.
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    truncate_impl(s, max_chars, "...")
}

fn truncate_impl(s: &str, max_chars: usize, suffix: &str) -> String {
    // Byte length is a cheap lower bound on char count.
    if s.len() <= max_chars {
        return s.to_string();
    }

    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s.to_string();
    }

    let suffix_len = suffix.chars().count();
    if max_chars <= suffix_len {
        return suffix.chars().take(max_chars).collect();
    }

    let truncated: String = s.chars().take(max_chars - suffix_len).collect();
    format!("{}{}", truncated, suffix)
}
