//! Markup stripping for visible page text.

use std::sync::LazyLock;

use regex::Regex;

static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
static INVISIBLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<noscript\b.*?</noscript>")
        .expect("valid regex")
});
static BLOCK_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(?:p|div|br|tr|li|ul|ol|h[1-6]|table|tbody|thead|section|article|header|footer)\b[^>]*>")
        .expect("valid regex")
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));
static NUMERIC_ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("valid regex"));

const NAMED_ENTITIES: &[(&str, &str)] = &[
    ("&nbsp;", " "),
    ("&euro;", "€"),
    ("&auml;", "ä"),
    ("&ouml;", "ö"),
    ("&uuml;", "ü"),
    ("&Auml;", "Ä"),
    ("&Ouml;", "Ö"),
    ("&Uuml;", "Ü"),
    ("&szlig;", "ß"),
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&apos;", "'"),
    ("&lt;", "<"),
    ("&gt;", ">"),
    // Must stay last so "&amp;nbsp;" decodes to the literal "&nbsp;".
    ("&amp;", "&"),
];

/// Visible text of a page: scripts, styles and comments removed, block
/// elements turned into line breaks, entities decoded, blank lines dropped.
#[must_use]
pub fn page_text(html: &str) -> String {
    let without_comments = COMMENT_RE.replace_all(html, " ");
    let visible = INVISIBLE_RE.replace_all(&without_comments, " ");
    let with_breaks = BLOCK_TAG_RE.replace_all(&visible, "\n");
    let stripped = TAG_RE.replace_all(&with_breaks, " ");
    let decoded = decode_entities(&stripped);

    decoded
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Single-line text of an HTML fragment such as a table cell.
pub(crate) fn inline_text(fragment: &str) -> String {
    let stripped = TAG_RE.replace_all(fragment, " ");
    decode_entities(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_owned();
    }
    let numeric = NUMERIC_ENTITY_RE.replace_all(s, |caps: &regex::Captures<'_>| {
        let body = &caps[1];
        let code = match body.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => body.parse::<u32>().ok(),
        };
        code.and_then(char::from_u32)
            .map_or_else(|| caps[0].to_owned(), |c| c.to_string())
    });
    NAMED_ENTITIES
        .iter()
        .fold(numeric.into_owned(), |acc, (entity, replacement)| {
            acc.replace(entity, replacement)
        })
}
