//! Post-processing: turn a raw vision-model reply into a [`Recognition`].
//!
//! Even well-prompted models wrap output in fences, use CRLF, or sprinkle
//! zero-width characters through the text. The rules below are cheap,
//! deterministic string passes applied in a fixed order:
//!
//! 1. Strip outer code fences
//! 2. Normalise line endings (CRLF → LF)
//! 3. Split off the trailing `CONFIDENCE:` line
//! 4. Strip invisible Unicode
//! 5. Trim trailing whitespace per line
//! 6. Collapse 3+ consecutive blank lines down to 2
//! 7. Trim the whole transcript
//!
//! The confidence line is removed before whitespace passes so a missing
//! newline before it cannot leave a dangling blank line in the text.

use crate::pipeline::ocr::Recognition;
use crate::prompts::{BLANK_MARKER, CONFIDENCE_PREFIX};
use once_cell::sync::Lazy;
use regex::Regex;

/// Parse a model reply. `fallback` is used when no confidence line is found.
pub fn parse_transcript(raw: &str, fallback: f32) -> Recognition {
    let s = strip_outer_fences(raw);
    let s = normalise_line_endings(&s);
    let (body, confidence) = split_confidence(&s);
    let s = remove_invisible_chars(body);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let text = s.trim();

    if text.is_empty() || text == BLANK_MARKER {
        return Recognition::EmptyPage;
    }
    Recognition::Text {
        text: text.to_string(),
        confidence: confidence.unwrap_or(fallback).clamp(0.0, 1.0),
    }
}

// ── Rule 1: Strip outer fences ──────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\r?\n(.*?)\r?\n```\s*$").unwrap());

fn strip_outer_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ──────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Confidence trailer ──────────────────────────────────────────────

static RE_CONFIDENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)(?:^|\n)[ \t]*{}[ \t]*([0-9]*\.?[0-9]+)(%?)[ \t]*\s*$",
        regex::escape(CONFIDENCE_PREFIX)
    ))
    .unwrap()
});

/// Split `input` into body and parsed confidence. Percentages are accepted.
fn split_confidence(input: &str) -> (&str, Option<f32>) {
    let Some(caps) = RE_CONFIDENCE.captures(input) else {
        return (input, None);
    };
    let Some(whole) = caps.get(0) else {
        return (input, None);
    };
    let value = caps[1].parse::<f32>().ok().map(|v| {
        if &caps[2] == "%" || v > 1.0 {
            v / 100.0
        } else {
            v
        }
    });
    (&input[..whole.start()], value.filter(|v| v.is_finite()))
}

// ── Rule 4: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 5: Trim trailing whitespace per line ───────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 6: Collapse excessive blank lines ──────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(r: &Recognition) -> (&str, f32) {
        match r {
            Recognition::Text { text, confidence } => (text.as_str(), *confidence),
            Recognition::EmptyPage => panic!("expected text, got EmptyPage"),
        }
    }

    #[test]
    fn parses_text_and_confidence() {
        let r = parse_transcript("Hello world\nSecond line\nCONFIDENCE: 0.93", 0.5);
        let (text, conf) = text_of(&r);
        assert_eq!(text, "Hello world\nSecond line");
        assert!((conf - 0.93).abs() < 1e-6);
    }

    #[test]
    fn missing_confidence_uses_fallback() {
        let r = parse_transcript("Just text", 0.5);
        assert_eq!(text_of(&r), ("Just text", 0.5));
    }

    #[test]
    fn percent_confidence_is_scaled() {
        let r = parse_transcript("abc\nconfidence: 87%", 0.5);
        let (_, conf) = text_of(&r);
        assert!((conf - 0.87).abs() < 1e-6);
    }

    #[test]
    fn out_of_range_confidence_is_clamped() {
        let r = parse_transcript("abc\nCONFIDENCE: 250", 0.5);
        assert_eq!(text_of(&r).1, 1.0);
    }

    #[test]
    fn blank_marker_is_empty_page() {
        assert_eq!(
            parse_transcript("[BLANK]\nCONFIDENCE: 1.0", 0.5),
            Recognition::EmptyPage
        );
        assert_eq!(parse_transcript("   \n\n", 0.5), Recognition::EmptyPage);
        assert_eq!(parse_transcript("CONFIDENCE: 0.9", 0.5), Recognition::EmptyPage);
    }

    #[test]
    fn strips_fences_and_crlf() {
        let raw = "```text\r\nLine one\r\nLine two\r\n```";
        let r = parse_transcript(raw, 0.5);
        assert_eq!(text_of(&r).0, "Line one\nLine two");
    }

    #[test]
    fn removes_invisible_characters() {
        let r = parse_transcript("hel\u{200B}lo\u{FEFF}", 0.5);
        assert_eq!(text_of(&r).0, "hello");
    }

    #[test]
    fn collapses_blank_runs() {
        let r = parse_transcript("a\n\n\n\n\n\nb", 0.5);
        assert_eq!(text_of(&r).0, "a\n\n\nb");
    }

    #[test]
    fn confidence_mid_text_is_kept_as_text() {
        let r = parse_transcript("CONFIDENCE: 0.2 is a heading\nbody", 0.5);
        let (text, conf) = text_of(&r);
        assert!(text.starts_with("CONFIDENCE: 0.2"));
        assert_eq!(conf, 0.5);
    }
}
