//! Deterministic cleanup of model replies.
//!
//! Even well-prompted models wrap JSON or prose in code fences, emit CRLF
//! line endings, or sprinkle zero-width characters. These rules undo that
//! without touching content.

use once_cell::sync::Lazy;
use regex::Regex;

// ── Code fences ──────────────────────────────────────────────────────────

/// Drop every line that opens or closes a fence when the reply starts with
/// one; otherwise return the trimmed input.
pub fn strip_code_fences(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

static RE_OUTER_FENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z]*\n(.*)\n```\s*$").expect("static regex is valid")
});

/// Remove a single pair of fences wrapping the whole reply. Inner fences are
/// content and survive.
fn strip_outer_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Whitespace ───────────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{4,}").expect("static regex is valid"));

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Invisible characters ─────────────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' | '\u{00AD}' | '\u{2060}'
            )
        })
        .collect()
}

/// Cleanup applied to every formatter reply.
pub fn clean_formatted(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_outer_fences(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    remove_invisible_chars(&s).trim().to_string()
}
