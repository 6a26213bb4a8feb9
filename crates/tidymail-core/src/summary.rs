//! Bounded text summaries of messages for the classifier.

use std::sync::LazyLock;

use mailparse::{MailHeaderMap, ParsedMail};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

/// Maximum depth for MIME tree traversal.
const MAX_MIME_DEPTH: usize = 50;

const VISIBLE_TAGS: [&str; 9] = ["div", "p", "span", "td", "li", "h1", "h2", "h3", "a"];

static VISIBLE_SELECTOR: LazyLock<Option<Selector>> =
    LazyLock::new(|| Selector::parse(&VISIBLE_TAGS.join(", ")).ok());
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));
static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+|www\.\S+").expect("valid url regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("message could not be parsed: {0}")]
    Parse(#[from] mailparse::MailParseError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailSummary {
    pub from: String,
    pub subject: String,
    pub date: String,
    pub body: String,
}

impl EmailSummary {
    /// Text handed to the classifier.
    pub fn render(&self) -> String {
        format!(
            "From: {}\nSubject: {}\nDate: {}\n\nBody: {}",
            self.from, self.subject, self.date, self.body
        )
    }
}

/// Summarize a full RFC 5322 message, keeping at most `budget` characters of body.
pub fn summarize_message(raw: &[u8], budget: usize) -> Result<EmailSummary, SummaryError> {
    let parsed = mailparse::parse_mail(raw)?;
    let header = |name: &str| parsed.headers.get_first_value(name).unwrap_or_default();

    let body = match find_body(&parsed) {
        Some(Body::Plain(text)) => clean_text(&text),
        Some(Body::Html(html)) => clean_text(&html_visible_text(&html)),
        None => String::new(),
    };

    Ok(EmailSummary {
        from: header("From"),
        subject: header("Subject"),
        date: header("Date"),
        body: truncate_chars(&body, budget),
    })
}

enum Body {
    Plain(String),
    Html(String),
}

/// First plain-text part, or the first HTML part when the message has no plain text.
fn find_body(parsed: &ParsedMail<'_>) -> Option<Body> {
    let mut plain = None;
    let mut html = None;
    collect_bodies(parsed, &mut plain, &mut html, 0);
    plain.map(Body::Plain).or(html.map(Body::Html))
}

fn collect_bodies(
    part: &ParsedMail<'_>,
    plain: &mut Option<String>,
    html: &mut Option<String>,
    depth: usize,
) {
    if depth > MAX_MIME_DEPTH || plain.is_some() {
        return;
    }

    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_bodies(sub, plain, html, depth + 1);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    if disposition.disposition == mailparse::DispositionType::Attachment {
        return;
    }

    match part.ctype.mimetype.to_ascii_lowercase().as_str() {
        "text/plain" if plain.is_none() => *plain = part.get_body().ok(),
        "text/html" if html.is_none() => *html = part.get_body().ok(),
        _ => {}
    }
}

/// Visible text of the content-bearing elements of an HTML body.
///
/// Elements nested inside another matched element are skipped so their text is
/// counted once. Documents with none of those elements fall back to a plain-text
/// rendering of the whole body.
pub fn html_visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let pieces: Vec<String> = VISIBLE_SELECTOR
        .as_ref()
        .map(|selector| {
            document
                .select(selector)
                .filter(|element| !has_visible_ancestor(element))
                .map(text_content)
                .filter(|text| !text.trim().is_empty())
                .collect()
        })
        .unwrap_or_default();

    if pieces.is_empty() {
        strip_html(html)
    } else {
        pieces.join(" ")
    }
}

fn has_visible_ancestor(element: &ElementRef<'_>) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|ancestor| VISIBLE_TAGS.contains(&ancestor.value().name()))
}

fn text_content(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ")
}

pub fn strip_html(html: &str) -> String {
    let mut bytes = std::io::Cursor::new(html.as_bytes());
    html2text::from_read(&mut bytes, 80)
        .trim()
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decode entities, drop leftover markup and links, and collapse whitespace.
pub fn clean_text(text: &str) -> String {
    let fragment = Html::parse_fragment(text);
    let decoded: String = fragment.root_element().text().collect();
    let without_tags = TAG.replace_all(&decoded, " ");
    let collapsed = WHITESPACE.replace_all(&without_tags, " ");
    let without_urls = URL.replace_all(&collapsed, "");
    WHITESPACE
        .replace_all(&without_urls, " ")
        .trim()
        .to_string()
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}
