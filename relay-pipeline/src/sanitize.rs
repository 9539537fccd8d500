//! Markdown normalization for outbound channel conventions (spec §4.8 step 9).
//!
//! Most channels (WhatsApp, Telegram userbot, email-as-plaintext) don't
//! render `**bold**`/`# heading`/`[label](url)` Markdown; this rewrites the
//! LLM's Markdown-flavored output into the single-asterisk emphasis and
//! inline-link conventions those channels actually display.

use regex::Regex;

/// `**x**` → `*x*`.
fn collapse_bold(text: &str) -> String {
    let re = Regex::new(r"\*\*([^*]+)\*\*").expect("static pattern");
    re.replace_all(text, "*$1*").into_owned()
}

/// `#+ X` → `*X*`, at the start of a line.
fn collapse_headings(text: &str) -> String {
    let re = Regex::new(r"(?m)^#+\s*(.+)$").expect("static pattern");
    re.replace_all(text, "*$1*").into_owned()
}

/// `[label](url)` → `label: url`.
fn collapse_links(text: &str) -> String {
    let re = Regex::new(r"\[([^\]]*)\]\(([^)]+)\)").expect("static pattern");
    re.replace_all(text, "$1: $2").into_owned()
}

/// Applies all three rewrites in order, then trims surrounding whitespace.
pub fn sanitize_markdown(text: &str) -> String {
    let text = collapse_headings(text);
    let text = collapse_bold(&text);
    let text = collapse_links(&text);
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_bold() {
        assert_eq!(sanitize_markdown("this is **important**"), "this is *important*");
    }

    #[test]
    fn collapses_heading() {
        assert_eq!(sanitize_markdown("## Next steps\nbody"), "*Next steps*\nbody");
    }

    #[test]
    fn collapses_link() {
        assert_eq!(sanitize_markdown("see [our docs](https://example.com/docs)"), "see our docs: https://example.com/docs");
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(sanitize_markdown("  hello  \n"), "hello");
    }

    #[test]
    fn combines_all_rewrites() {
        let input = "# Title\n**bold** and [link](https://x)";
        assert_eq!(sanitize_markdown(input), "*Title*\n*bold* and link: https://x");
    }
}
