//! Splitting and truncation of outbound text.
//!
//! Lengths are counted in characters, and every cut lands on a char boundary.

/// Telegram's per-message text limit.
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;
/// Telegram's media caption limit.
pub const TELEGRAM_CAPTION_LIMIT: usize = 1024;

/// Break candidates, strongest first.
const BREAKS: [&str; 3] = ["\n\n", "\n", " "];

/// Byte offset of the `n`-th char (or the end of `s`).
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}

/// Split `text` into chunks of at most `max_len` characters.
///
/// Each cut prefers a blank line, then a newline, then a space, and falls back
/// to a hard cut at `max_len`. A break is only taken if it lies beyond 30% of
/// `max_len`, so no chunk is pathologically short. Leading whitespace of each
/// remainder is trimmed.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 || text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let min_break = max_len * 3 / 10;
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > max_len {
        let head_end = byte_offset(rest, max_len);
        let head = &rest[..head_end];
        let cut = best_break(head, min_break).unwrap_or(head_end);
        chunks.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

fn best_break(head: &str, min_chars: usize) -> Option<usize> {
    BREAKS.iter().find_map(|sep| {
        head.rfind(sep)
            .filter(|&pos| head[..pos].chars().count() > min_chars)
    })
}

/// Shorten `text` to at most `cap` characters, ending with an ellipsis.
///
/// Cuts at the last word boundary beyond half the cap when there is one.
pub fn truncate_caption(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    if cap == 0 {
        return String::new();
    }

    let head = &text[..byte_offset(text, cap - 1)];
    let cut = match head.rfind(char::is_whitespace) {
        Some(pos) if head[..pos].chars().count() > cap / 2 => &head[..pos],
        _ => head,
    };
    format!("{}\u{2026}", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_single_chunk() {
        assert_eq!(split_message("hello", 4096), vec!["hello"]);
        assert_eq!(split_message("", 10), vec![""]);
    }

    #[test]
    fn test_prefers_blank_line() {
        let text = format!("{}\n\n{}", "a".repeat(2400), "b".repeat(2598));
        assert_eq!(text.chars().count(), 5000);

        let chunks = split_message(&text, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(2400));
        assert_eq!(chunks[1], "b".repeat(2598));
    }

    #[test]
    fn test_newline_then_space_then_hard_cut() {
        let text = "aaaaaa\nbbbb cc";
        assert_eq!(split_message(text, 10), vec!["aaaaaa", "bbbb cc"]);

        let text = "aaaaaa bbbbbbb";
        assert_eq!(split_message(text, 10), vec!["aaaaaa", "bbbbbbb"]);

        let text = "abcdefghijklmnop";
        assert_eq!(split_message(text, 10), vec!["abcdefghij", "klmnop"]);
    }

    #[test]
    fn test_break_too_early_is_ignored() {
        // The only blank line sits at 20% of the limit; the space at 80% wins.
        let text = "aa\n\nbbbbb ccccccccc";
        let chunks = split_message(text, 10);
        assert_eq!(chunks[0], "aa\n\nbbbbb");
        assert_eq!(chunks[1], "ccccccccc");
    }

    #[test]
    fn test_chunks_respect_limit_for_multibyte_text() {
        let text = "é".repeat(25);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_truncate_caption_at_word_boundary() {
        let caption = "one two three four five six";
        let out = truncate_caption(caption, 16);
        assert_eq!(out, "one two three\u{2026}");
        assert!(out.chars().count() <= 16);
    }

    #[test]
    fn test_truncate_caption_hard_cut_without_late_space() {
        let caption = "ab ".to_string() + &"x".repeat(30);
        let out = truncate_caption(&caption, 10);
        assert_eq!(out, "ab xxxxxx\u{2026}");
        assert_eq!(out.chars().count(), 10);
    }

    #[test]
    fn test_truncate_caption_short_untouched() {
        assert_eq!(truncate_caption("short", 1024), "short");
    }
}
