//! Content metrics for successful fetches

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use crate::domain::entities::ContentMetrics;

static MARKDOWN_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]*\]\([^)\s]+(?:\s+[^)]*)?\)").expect("valid link regex"));
static MARKDOWN_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\([^)\s]+(?:\s+[^)]*)?\)").expect("valid image regex"));
static IMG_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<img\b[^>]*>").expect("valid img regex"));
static LD_JSON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<script\b[^>]*type\s*=\s*["']?application/ld\+json["']?[^>]*>"#)
        .expect("valid ld+json regex")
});

/// Computes snapshot metrics for one successful fetch
///
/// `reported_links` is the parser's link count; it is trusted unless it is
/// zero while the markdown has content, in which case links are counted in
/// the markdown itself.
pub fn compute(
    markdown: &str,
    reported_links: usize,
    raw_body: &str,
    previous_markdown: Option<&str>,
) -> ContentMetrics {
    let link_count = if reported_links == 0 && !markdown.trim().is_empty() {
        count_markdown_links(markdown)
    } else {
        reported_links
    };

    ContentMetrics {
        content_length: markdown.len() as u64,
        link_count: link_count as u32,
        media_count: count_media(markdown) as u32,
        structured_data_count: count_structured_data(raw_body) as u32,
        content_change_percentage: previous_markdown.map(|prev| change_percentage(prev, markdown)),
    }
}

/// Markdown links, images excluded
pub fn count_markdown_links(markdown: &str) -> usize {
    MARKDOWN_LINK
        .find_iter(markdown)
        .count()
        .saturating_sub(MARKDOWN_IMAGE.find_iter(markdown).count())
}

/// Markdown images plus raw `<img>` tags
pub fn count_media(markdown: &str) -> usize {
    MARKDOWN_IMAGE.find_iter(markdown).count() + IMG_TAG.find_iter(markdown).count()
}

/// `application/ld+json` script blocks in the raw response body
pub fn count_structured_data(raw_body: &str) -> usize {
    LD_JSON.find_iter(raw_body).count()
}

/// Share of distinct non-blank lines that changed, 0-100, two decimals
pub fn change_percentage(previous: &str, current: &str) -> f64 {
    let lines = |text: &'_ str| -> HashSet<String> {
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect()
    };
    let before = lines(previous);
    let after = lines(current);

    let union = before.union(&after).count();
    if union == 0 {
        return 0.0;
    }
    let changed = before.symmetric_difference(&after).count();
    (changed as f64 / union as f64 * 10_000.0).round() / 100.0
}

/// Cuts to `limit` characters and appends an ellipsis when longer
pub fn truncate_description(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(limit).collect();
    truncated.push_str("...");
    truncated
}

/// blake3 digest of the stored markdown
pub fn content_hash(markdown: &str) -> String {
    blake3::hash(markdown.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKDOWN: &str = "# Title\n\nSee [docs](https://example.com/docs) and [blog](https://example.com/blog \"Blog\").\n\n![cover](https://example.com/c.png)\n<img src=\"inline.png\">\n";

    #[test]
    fn links_exclude_images() {
        assert_eq!(count_markdown_links(MARKDOWN), 2);
        assert_eq!(count_media(MARKDOWN), 2);
    }

    #[test]
    fn reported_link_count_wins_unless_zero() {
        assert_eq!(compute(MARKDOWN, 7, "", None).link_count, 7);
        assert_eq!(compute(MARKDOWN, 0, "", None).link_count, 2);
        assert_eq!(compute("", 0, "", None).link_count, 0);
    }

    #[test]
    fn structured_data_counts_ld_json_blocks() {
        let body = r#"<script type="application/ld+json">{}</script><script TYPE='application/ld+json'>{}</script><script>var x;</script>"#;
        assert_eq!(count_structured_data(body), 2);
    }

    #[test]
    fn change_percentage_is_line_based() {
        assert!(change_percentage("a\nb", "a\nb").abs() < f64::EPSILON);
        assert!((change_percentage("a\nb", "a\nc") - 66.67).abs() < 0.001);
        assert!((change_percentage("a", "b") - 100.0).abs() < f64::EPSILON);
        assert!(compute("x", 0, "", None).content_change_percentage.is_none());
    }

    #[test]
    fn description_truncation_appends_ellipsis() {
        let long = "é".repeat(1100);
        let cut = truncate_description(&long, 1024);
        assert_eq!(cut.chars().count(), 1027);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate_description("short", 1024), "short");
    }
}
