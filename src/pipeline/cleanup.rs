//! Deterministic cleanup of OCR-produced Markdown.
//!
//! OCR models wrap their answer in code fences, emit CRLF, leave trailing
//! blanks and sprinkle zero-width characters. These rules fix that without
//! touching content. Placeholder tokens pass through untouched: the gateway
//! counts them after cleanup, so no rule may create or remove one.
//!
//! Rules (applied in order):
//! 1. Strip outer Markdown fences
//! 2. Normalise line endings (CRLF → LF)
//! 3. Trim trailing whitespace per line
//! 4. Collapse 3+ consecutive blank lines down to 2
//! 5. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
//! 6. End with exactly one newline

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to raw OCR Markdown.
pub fn clean_markdown(input: &str) -> String {
    let s = strip_markdown_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    ensure_final_newline(&s)
}

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\r?\n(.*)\r?\n```\s*$").unwrap());

fn strip_markdown_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").into_owned()
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'], "")
}

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{trimmed}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ocr::PLACEHOLDER;

    #[test]
    fn strips_fences_with_and_without_language() {
        assert_eq!(strip_markdown_fences("```markdown\n# A\nB\n```"), "# A\nB");
        assert_eq!(strip_markdown_fences("```\n# A\n```"), "# A");
        assert_eq!(strip_markdown_fences("# A"), "# A");
    }

    #[test]
    fn collapses_blank_runs() {
        assert_eq!(collapse_blank_lines("a\n\n\n\n\n\nb"), "a\n\n\nb");
    }

    #[test]
    fn final_newline_is_single() {
        assert_eq!(ensure_final_newline("x\n\n\n"), "x\n");
        assert_eq!(ensure_final_newline(""), "\n");
    }

    #[test]
    fn placeholders_survive_every_rule() {
        let input = format!(
            "```markdown\r\nIntro   \r\n{PLACEHOLDER}\r\n\r\n\r\n\r\n\r\nText\u{200B} {PLACEHOLDER}\r\n```"
        );
        let out = clean_markdown(&input);
        assert_eq!(out.matches(PLACEHOLDER).count(), 2);
        assert!(out.starts_with("Intro\n"));
        assert!(!out.contains('\r'));
        assert!(!out.contains('\u{200B}'));
        assert!(out.ends_with("Text <|image|>\n"));
    }
}
