//! Text shaping helpers for outbound Discord messages and schedule output.

use once_cell::sync::Lazy;
use regex::Regex;

static THINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());

/// Split a message into chunks of at most `max_len` characters.
///
/// Prefers the last newline before the limit, then the last space, both
/// searched backwards; falls back to a hard cut. Chunks are trimmed at the
/// cut points and whitespace-only chunks are dropped, so an all-whitespace
/// input yields no chunks at all.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    assert!(max_len > 0);
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= max_len {
            push_chunk(&mut chunks, &chars[start..]);
            break;
        }

        let window = &chars[start..start + max_len];
        let boundary = window
            .iter()
            .rposition(|&c| c == '\n')
            .or_else(|| window.iter().rposition(|&c| c == ' '));

        match boundary {
            Some(idx) if idx > 0 => {
                push_chunk(&mut chunks, &chars[start..start + idx]);
                // The boundary character itself is consumed by the cut.
                start += idx + 1;
            }
            _ => {
                push_chunk(&mut chunks, window);
                start += max_len;
            }
        }
    }

    chunks
}

fn push_chunk(chunks: &mut Vec<String>, chars: &[char]) {
    let chunk: String = chars.iter().collect();
    let trimmed = chunk.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// A schedule's output is discarded when the cleaned text starts or ends
/// with the literal `[SKIP]`.
pub fn is_skip_response(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with("[SKIP]") || trimmed.ends_with("[SKIP]")
}

/// Remove every `<think>…</think>` span (multiline included), preserving
/// the surrounding text exactly.
pub fn strip_think_tags(text: &str) -> String {
    THINK_RE.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("hello", 2000), vec!["hello"]);
    }

    #[test]
    fn whitespace_only_yields_nothing() {
        assert!(split_message("   \n\n  ", 2000).is_empty());
        assert!(split_message("", 2000).is_empty());
    }

    #[test]
    fn splits_at_last_newline_before_limit() {
        let text = format!("{}\n{}", "a".repeat(1500), "b".repeat(2000));
        let chunks = split_message(&text, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(1500));
        assert_eq!(chunks[1], "b".repeat(2000));
    }

    #[test]
    fn splits_at_space_when_no_newline() {
        let text = format!("{} {}", "a".repeat(1990), "b".repeat(100));
        let chunks = split_message(&text, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(1990));
        assert_eq!(chunks[1], "b".repeat(100));
    }

    #[test]
    fn hard_cut_without_boundaries() {
        let text = "a".repeat(4100);
        let chunks = split_message(&text, 2000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 2000);
        assert_eq!(chunks[1].chars().count(), 2000);
        assert_eq!(chunks[2].chars().count(), 100);
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "🦀".repeat(2500);
        let chunks = split_message(&text, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 2000);
        assert_eq!(chunks[1].chars().count(), 500);
    }

    #[test]
    fn three_and_a_half_k_reply_splits_in_two() {
        let text = format!("{}\n{}", "x".repeat(1800), "y".repeat(1700));
        let chunks = split_message(&text, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "x".repeat(1800));
        assert_eq!(chunks[1], "y".repeat(1700));
    }

    #[test]
    fn skip_detection() {
        assert!(is_skip_response("[SKIP]"));
        assert!(is_skip_response("[SKIP]\nnothing to say"));
        assert!(is_skip_response("nothing to say [SKIP]"));
        assert!(is_skip_response("  [SKIP] trailing context  "));
        assert!(!is_skip_response("no skip here"));
        assert!(!is_skip_response("mid [SKIP] sentence"));
    }

    #[test]
    fn think_tags_removed() {
        assert_eq!(strip_think_tags("a<think>x</think>b"), "ab");
        assert_eq!(
            strip_think_tags("start<think>line1\nline2</think>end"),
            "startend"
        );
        assert_eq!(
            strip_think_tags("<think>1</think>mid<think>2</think>"),
            "mid"
        );
        assert_eq!(strip_think_tags("untouched"), "untouched");
    }

    mod proptest_split {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn chunks_respect_limit_and_are_never_blank(
                s in "\\PC{0,6000}",
                max in 1usize..3000,
            ) {
                for chunk in split_message(&s, max) {
                    prop_assert!(chunk.chars().count() <= max);
                    prop_assert!(!chunk.trim().is_empty());
                }
            }

            #[test]
            fn no_content_is_invented(s in "[a-z \\n]{0,6000}") {
                let rejoined: String = split_message(&s, 100).concat();
                let original: String = s.chars().filter(|c| !c.is_whitespace()).collect();
                let got: String = rejoined.chars().filter(|c| !c.is_whitespace()).collect();
                prop_assert_eq!(original, got);
            }
        }
    }
}
