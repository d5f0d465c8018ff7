//! Default HTML collaborators
//!
//! - [`RegexHtmlCleaner`]: strips scripts, styles and comments
//! - [`MetaTagClassifier`]: classification from OpenGraph/meta tags
//! - [`ScraperPageParser`]: title, meta fields, links and a markdown rendering

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use tracing::debug;
use url::Url;

use crate::domain::services::{
    Classification, ContentClassifier, HtmlCleaner, PageData, PageParser,
};

static SCRIPT_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|noscript|template|iframe)\b[^>]*>.*?</(script|style|noscript|template|iframe)\s*>")
        .expect("valid script regex")
});
static HTML_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid comment regex"));
static BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid blank regex"));
static INLINE_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\r\n]+").expect("valid space regex"));
static TRAILING_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)/?$").expect("valid number regex"));

/// Regex-based best-effort normalization
#[derive(Debug, Default, Clone)]
pub struct RegexHtmlCleaner;

impl HtmlCleaner for RegexHtmlCleaner {
    fn clean(&self, html: &str) -> String {
        let without_scripts = SCRIPT_LIKE.replace_all(html, "");
        HTML_COMMENT.replace_all(&without_scripts, "").into_owned()
    }
}

fn meta_content(document: &Html, key: &str) -> Option<String> {
    static META: Lazy<Selector> = Lazy::new(|| Selector::parse("meta").expect("valid selector"));
    document
        .select(&META)
        .find(|m| {
            let value = m.value();
            value.attr("property").or_else(|| value.attr("name")).is_some_and(|k| k.eq_ignore_ascii_case(key))
        })
        .and_then(|m| m.value().attr("content"))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(ToString::to_string)
}

fn meta_timestamp(document: &Html, key: &str) -> Option<DateTime<Utc>> {
    meta_content(document, key)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Classifies pages from OpenGraph and standard meta tags; no external cost
#[derive(Debug, Default, Clone)]
pub struct MetaTagClassifier;

impl MetaTagClassifier {
    fn classify_document(html: &str) -> Classification {
        let document = Html::parse_document(html);

        let og_type = meta_content(&document, "og:type").map(|t| t.to_lowercase());
        let page_type = match og_type.as_deref() {
            Some("article" | "blog" | "news") => Some("article".to_string()),
            Some("product" | "product.item") => Some("product".to_string()),
            Some("profile") => Some("profile".to_string()),
            Some("website") => Some("website".to_string()),
            Some(other) => Some(other.to_string()),
            None => None,
        };

        let has_publish_time = meta_content(&document, "article:published_time").is_some();
        let temporal = Some(if has_publish_time { "timely" } else { "evergreen" }.to_string());

        let tags = meta_content(&document, "keywords")
            .map(|k| {
                k.split(',')
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Classification {
            content_type: Some("text/html".to_string()),
            page_type,
            temporal,
            description: meta_content(&document, "description")
                .or_else(|| meta_content(&document, "og:description")),
            tags,
            cost: 0.0,
        }
    }
}

#[async_trait]
impl ContentClassifier for MetaTagClassifier {
    async fn classify(&self, html: &str) -> Result<Classification> {
        Ok(Self::classify_document(html))
    }
}

/// `scraper`-based page parser
#[derive(Debug, Default, Clone)]
pub struct ScraperPageParser;

impl ScraperPageParser {
    fn parse_document(html: &str, page_url: &str) -> Result<PageData> {
        static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").expect("valid selector"));
        static H1: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").expect("valid selector"));
        static CANONICAL: Lazy<Selector> = Lazy::new(|| Selector::parse("link[rel='canonical']").expect("valid selector"));
        static ANCHORS: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("valid selector"));
        static BODY: Lazy<Selector> = Lazy::new(|| Selector::parse("body").expect("valid selector"));

        let base = Url::parse(page_url)?;
        let document = Html::parse_document(html);

        let title = meta_content(&document, "og:title")
            .or_else(|| document.select(&TITLE).next().map(|t| collapse(&t.text().collect::<String>())))
            .or_else(|| document.select(&H1).next().map(|h| collapse(&h.text().collect::<String>())))
            .filter(|t| !t.is_empty());

        let canonical_url = document
            .select(&CANONICAL)
            .next()
            .and_then(|link| link.value().attr("href"))
            .and_then(|href| base.join(href).ok())
            .map(|u| u.to_string());
        let canonical_number = canonical_url
            .as_deref()
            .and_then(|u| Url::parse(u).ok())
            .and_then(|u| TRAILING_NUMBER.captures(u.path()).map(|c| c[1].to_string()));

        let mut seen = HashSet::new();
        let linked_page_urls = document
            .select(&ANCHORS)
            .filter_map(|a| a.value().attr("href"))
            .filter_map(|href| base.join(href.trim()).ok())
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .map(|mut u| {
                u.set_fragment(None);
                u.to_string()
            })
            .filter(|u| seen.insert(u.clone()))
            .collect::<Vec<_>>();

        let mut markdown = String::new();
        match document.select(&BODY).next() {
            Some(body) => render_markdown(body, &base, &mut markdown),
            None => render_markdown(document.root_element(), &base, &mut markdown),
        }

        debug!(
            "Parsed {}: {} links, {} markdown chars",
            page_url,
            linked_page_urls.len(),
            markdown.len()
        );

        Ok(PageData {
            title,
            excerpt: meta_content(&document, "description")
                .or_else(|| meta_content(&document, "og:description")),
            thumbnail_url: meta_content(&document, "og:image")
                .and_then(|src| base.join(&src).ok())
                .map(|u| u.to_string()),
            markdown_content: tidy_markdown(&markdown),
            published_at: meta_timestamp(&document, "article:published_time"),
            updated_at: meta_timestamp(&document, "article:modified_time")
                .or_else(|| meta_timestamp(&document, "og:updated_time")),
            canonical_url,
            canonical_number,
            linked_page_urls,
            cost: 0.0,
        })
    }
}

#[async_trait]
impl PageParser for ScraperPageParser {
    async fn parse(&self, html: &str, page_url: &str) -> Result<PageData> {
        Self::parse_document(html, page_url)
    }
}

fn collapse(text: &str) -> String {
    INLINE_SPACE.replace_all(text, " ").trim().to_string()
}

fn resolve(base: &Url, href: &str) -> String {
    base.join(href.trim())
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.trim().to_string())
}

/// Minimal HTML to markdown rendering
fn render_markdown(element: ElementRef<'_>, base: &Url, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            let text = INLINE_SPACE.replace_all(text, " ");
            if !(text == " " && (out.is_empty() || out.ends_with(['\n', ' ']))) {
                out.push_str(&text);
            }
            continue;
        }
        let Some(child) = ElementRef::wrap(child) else {
            continue;
        };

        let name = child.value().name();
        match name {
            "script" | "style" | "noscript" | "template" | "head" | "iframe" => {}
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = usize::from(name.as_bytes()[1] - b'0');
                out.push_str("\n\n");
                out.push_str(&"#".repeat(level));
                out.push(' ');
                out.push_str(&collapse(&child.text().collect::<String>()));
                out.push_str("\n\n");
            }
            "br" => out.push('\n'),
            "hr" => out.push_str("\n\n---\n\n"),
            "li" => {
                out.push_str("\n- ");
                render_markdown(child, base, out);
            }
            "a" => {
                let label = collapse(&child.text().collect::<String>());
                match child.value().attr("href") {
                    Some(href) if !label.is_empty() => {
                        out.push_str(&format!("[{}]({})", label, resolve(base, href)));
                    }
                    _ => render_markdown(child, base, out),
                }
            }
            "img" => {
                if let Some(src) = child.value().attr("src") {
                    let alt = child.value().attr("alt").unwrap_or_default();
                    out.push_str(&format!("![{}]({})", alt.trim(), resolve(base, src)));
                }
            }
            "strong" | "b" => {
                out.push_str("**");
                render_markdown(child, base, out);
                out.push_str("**");
            }
            "em" | "i" => {
                out.push('_');
                render_markdown(child, base, out);
                out.push('_');
            }
            "p" | "div" | "section" | "article" | "main" | "header" | "footer" | "ul" | "ol"
            | "table" | "tr" | "blockquote" | "pre" | "figure" | "nav" | "aside" => {
                out.push_str("\n\n");
                render_markdown(child, base, out);
                out.push_str("\n\n");
            }
            _ => render_markdown(child, base, out),
        }
    }
}

fn tidy_markdown(raw: &str) -> String {
    let lines = raw.lines().map(str::trim_end).collect::<Vec<_>>().join("\n");
    BLANK_RUN.replace_all(&lines, "\n\n").trim().to_string()
}
