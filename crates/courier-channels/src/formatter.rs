//! Outbound formatter: lightweight markdown to Telegram HTML.
//!
//! The conversion is a fixed pipeline: code is lifted out behind placeholders
//! before anything else touches the text, the rest is escaped and styled, and
//! code is put back last (inline spans first, then fenced blocks). Reordering
//! the steps lets style markers inside code turn into tags.

use regex_lite::Regex;
use std::sync::OnceLock;

/// Private-use code points that cannot collide with user text or markup.
const BLOCK_MARK: char = '\u{E000}';
const INLINE_MARK: char = '\u{E001}';
const MARK_END: char = '\u{E002}';

fn code_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:([A-Za-z0-9_+#.\-]+)?[ \t]*\n)?(.*?)```")
            .expect("code block regex is valid")
    })
}

fn inline_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([^`\n]+)`").expect("inline code regex is valid"))
}

fn bold_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*(.+?)\*\*").expect("bold regex is valid"))
}

fn strike_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"~~(.+?)~~").expect("strikethrough regex is valid"))
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[([^\]\n]+)\]\(([^)\s]+)\)").expect("link regex is valid")
    })
}

/// Escape the characters Telegram's HTML parse mode treats as markup.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

fn placeholder(mark: char, index: usize) -> String {
    format!("{mark}{index}{MARK_END}")
}

/// Convert the supported markdown dialect to Telegram HTML.
///
/// Supported: `**bold**`, `*italic*`, `~~strike~~`, `` `code` ``, fenced code
/// blocks with an optional language tag, and `[text](url)` links.
pub fn markdown_to_telegram_html(text: &str) -> String {
    // 1. Fenced code blocks.
    let mut blocks: Vec<String> = Vec::new();
    let text = code_block_re().replace_all(text, |caps: &regex_lite::Captures<'_>| {
        let body = caps.get(2).map_or("", |m| m.as_str());
        let body = escape_html(body.trim_end_matches('\n'));
        let html = match caps.get(1) {
            Some(lang) => format!(
                "<pre><code class=\"language-{}\">{body}</code></pre>",
                lang.as_str()
            ),
            None => format!("<pre>{body}</pre>"),
        };
        blocks.push(html);
        placeholder(BLOCK_MARK, blocks.len() - 1)
    });

    // 2. Inline code spans.
    let mut spans: Vec<String> = Vec::new();
    let text = inline_code_re().replace_all(&text, |caps: &regex_lite::Captures<'_>| {
        let body = caps.get(1).map_or("", |m| m.as_str());
        spans.push(format!("<code>{}</code>", escape_html(body)));
        placeholder(INLINE_MARK, spans.len() - 1)
    });

    // 3. Everything left is plain text.
    let text = escape_html(&text);

    // 4. Styles: bold before italic so `**` pairs are gone when italic runs.
    let text = bold_re().replace_all(&text, "<b>${1}</b>");
    let text = apply_italic(&text);
    let text = strike_re().replace_all(&text, "<s>${1}</s>");
    let mut text = link_re()
        .replace_all(&text, "<a href=\"${2}\">${1}</a>")
        .into_owned();

    // 5 + 6. Restore in reverse order of extraction.
    for (i, html) in spans.iter().enumerate() {
        text = text.replace(&placeholder(INLINE_MARK, i), html);
    }
    for (i, html) in blocks.iter().enumerate() {
        text = text.replace(&placeholder(BLOCK_MARK, i), html);
    }
    text
}

/// Wrap `*x*` in `<i>` where neither delimiter touches another asterisk and
/// the span stays on one line.
fn apply_italic(text: &str) -> String {
    let bytes = text.as_bytes();
    let is_star = |i: usize| bytes.get(i) == Some(&b'*');
    let lone_star = |i: usize| is_star(i) && !is_star(i + 1) && (i == 0 || !is_star(i - 1));

    let mut out = String::with_capacity(text.len() + 16);
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if !lone_star(i) || bytes.get(i + 1) == Some(&b'\n') {
            i += 1;
            continue;
        }
        let close = (i + 2..bytes.len())
            .take_while(|&j| bytes[j] != b'\n')
            .find(|&j| lone_star(j));
        match close {
            Some(j) => {
                // '*' is ASCII, so both indices sit on char boundaries.
                out.push_str(&text[copied..i]);
                out.push_str("<i>");
                out.push_str(&text[i + 1..j]);
                out.push_str("</i>");
                copied = j + 1;
                i = j + 1;
            }
            None => i += 1,
        }
    }
    out.push_str(&text[copied..]);
    out
}
