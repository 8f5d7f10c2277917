//! Page-content helpers shared by the browser fetcher and the mirror sources.

use scraper::{Html, Selector};

/// Phrases that mean a bot check is in the way.
const CAPTCHA_MARKERS: &[&str] = &[
    "solving the above captcha",
    "unusual traffic",
    "please show you're not a robot",
    "verify you are human",
    "are you a robot",
    "g-recaptcha",
    "cf-challenge",
    "checking your browser before accessing",
];

/// Visible text of an HTML document, one text node per line.
///
/// Text inside `script`, `style`, `noscript` and `template` is skipped.
pub fn visible_text(html: &str) -> String {
    visible_text_nodes(html).join("\n")
}

fn visible_text_nodes(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut lines = Vec::new();

    for node in document.tree.root().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name().to_string()))
            .is_some_and(|name| matches!(name.as_str(), "script" | "style" | "noscript" | "template"));
        if hidden {
            continue;
        }

        let trimmed = text.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }

    lines
}

/// Words of a title as the on-page check sees them.
fn title_words(title: &str) -> Vec<String> {
    title
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// True when a single visible text node contains every word of `title`.
pub fn title_on_page(html: &str, title: &str) -> bool {
    let words = title_words(title);
    if words.is_empty() {
        return true;
    }

    visible_text_nodes(html).iter().any(|line| {
        let line = line.to_lowercase();
        words.iter().all(|w| line.contains(w.as_str()))
    })
}

/// Case-insensitive phrase search over the visible text.
pub fn contains_phrase(html: &str, phrase: &str) -> bool {
    visible_text(html)
        .to_lowercase()
        .contains(&phrase.to_lowercase())
}

/// True when `css` parses and matches at least one element.
pub fn has_selector(html: &str, css: &str) -> bool {
    let Ok(selector) = Selector::parse(css) else {
        return false;
    };
    Html::parse_document(html).select(&selector).next().is_some()
}

/// Heuristic bot-check detection on raw page content.
pub fn looks_like_captcha(html: &str) -> bool {
    let lower = html.to_lowercase();
    CAPTCHA_MARKERS.iter().any(|m| lower.contains(m))
}

/// URL or content-type that points at a PDF rather than an HTML page.
pub fn is_pdf_hint(url_or_content_type: &str) -> bool {
    url_or_content_type.to_lowercase().contains("pdf")
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
