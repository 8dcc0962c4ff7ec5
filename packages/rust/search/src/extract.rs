//! HTML → Markdown extraction for fetched pages.

use std::sync::LazyLock;

use dossier_shared::{DossierError, Result};
use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;

/// Marker appended to content cut at the character limit.
const TRUNCATION_MARKER: &str = "\n[...truncated]";

/// Tags dropped entirely during conversion.
const SKIP_TAGS: [&str; 15] = [
    "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "form",
    "button", "input", "select", "textarea", "svg", "link",
];

/// Content containers tried in priority order before falling back to `<body>`.
const CONTENT_SELECTORS: [&str; 8] = [
    "main",
    "article",
    r#"[role="main"]"#,
    ".content",
    ".main-content",
    ".post-content",
    ".entry-content",
    "#content",
];

/// Extract the page title and the main content as Markdown.
pub fn extract_main_markdown(html: &str) -> Result<(Option<String>, String)> {
    let doc = Html::parse_document(html);
    let title = extract_title(&doc);
    let content_html = content_html(&doc).unwrap_or_else(|| html.to_string());

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIP_TAGS.to_vec())
        .build();
    let markdown = converter
        .convert(&content_html)
        .map_err(|e| DossierError::Conversion(format!("htmd conversion failed: {e}")))?;

    let cleaned = collapse_blank_lines(markdown.trim());
    debug!(title = ?title, len = cleaned.len(), "extracted page content");
    Ok((title, cleaned))
}

/// Cut `content` to at most `max_chars` characters, marking the cut.
pub fn truncate_content(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        None => content.to_string(),
        Some((byte_idx, _)) => format!("{}{TRUNCATION_MARKER}", &content[..byte_idx]),
    }
}

fn content_html(doc: &Html) -> Option<String> {
    for sel_str in CONTENT_SELECTORS.iter().chain(std::iter::once(&"body")) {
        if let Ok(selector) = Selector::parse(sel_str) {
            if let Some(el) = doc.select(&selector).next() {
                return Some(el.inner_html());
            }
        }
    }
    None
}

fn extract_title(doc: &Html) -> Option<String> {
    static TITLE_SEL: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("title").expect("valid selector"));
    static H1_SEL: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("h1").expect("valid selector"));

    doc.select(&TITLE_SEL)
        .chain(doc.select(&H1_SEL))
        .map(|el| el.text().collect::<String>().trim().to_string())
        .find(|t| !t.is_empty())
}

/// Collapse runs of three or more newlines into one blank line.
fn collapse_blank_lines(s: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("valid regex"));
    MULTI_BLANK_RE.replace_all(s, "\n\n").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_main_over_chrome() {
        let html = r#"<html><head><title>Asthma in France</title></head><body>
            <nav><a href="/">Home</a></nav>
            <main><h1>Prevalence</h1><p>About 4 million adults.</p></main>
            <footer>Copyright</footer></body></html>"#;
        let (title, md) = extract_main_markdown(html).unwrap();
        assert_eq!(title.as_deref(), Some("Asthma in France"));
        assert!(md.contains("Prevalence"));
        assert!(md.contains("4 million adults"));
        assert!(!md.contains("Home"));
        assert!(!md.contains("Copyright"));
    }

    #[test]
    fn falls_back_to_body_and_skips_scripts() {
        let html = r#"<html><body><p>Plain body text</p><script>var x = 1;</script></body></html>"#;
        let (title, md) = extract_main_markdown(html).unwrap();
        assert!(title.is_none());
        assert!(md.contains("Plain body text"));
        assert!(!md.contains("var x"));
    }

    #[test]
    fn truncate_short_content() {
        assert_eq!(truncate_content("short text", 100), "short text");
    }

    #[test]
    fn truncate_long_content_marks_the_cut() {
        let out = truncate_content("abcdefghij", 4);
        assert_eq!(out, "abcd\n[...truncated]");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let out = truncate_content("ééééé", 2);
        assert!(out.starts_with("éé\n"));
    }

    #[test]
    fn blank_line_runs_collapse() {
        assert_eq!(collapse_blank_lines("a\n\n\n\nb"), "a\n\nb");
    }
}
