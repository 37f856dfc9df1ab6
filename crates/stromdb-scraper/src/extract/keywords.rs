//! Label vocabulary for the two price slots and comparison-row detection.

use std::sync::LazyLock;

use regex::Regex;

/// Labels for the local / baseline supplier price.
pub(crate) const LOCAL_KEYWORDS: &[&str] = &[
    "lokaler versorger",
    "grundversorger",
    "grundversorgung",
    "örtlicher versorger",
    "lokaler anbieter",
];

/// Labels for the cheapest green-energy tariff.
pub(crate) const GREEN_KEYWORDS: &[&str] = &[
    "günstigster ökostrom",
    "ökostromtarif",
    "ökostrom",
    "grüner strom",
];

/// Brand names that mark a row as a competitor comparison rather than the
/// headline figure for the location.
const COMPETITOR_TOKENS: &[&str] = &[
    "vattenfall",
    "e.on",
    "eon",
    "enbw",
    "rwe",
    "eprimo",
    "lichtblick",
    "tibber",
    "yello",
    "naturstrom",
    "ostrom",
    "octopus",
    "check24",
    "verivox",
];

/// Rows longer than this are prose, not a label/value pair.
pub(crate) const MAX_ROW_CHARS: usize = 200;

static COMPETITOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    let alternation = COMPETITOR_TOKENS
        .iter()
        .map(|t| regex::escape(t))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?i)(?:^|[^\p{{L}}\p{{N}}])(?:{alternation})(?:$|[^\p{{L}}\p{{N}}])"))
        .expect("valid regex")
});

/// Which of the two record fields a label feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriceSlot {
    Local,
    Green,
}

impl PriceSlot {
    pub(crate) const BOTH: [PriceSlot; 2] = [PriceSlot::Local, PriceSlot::Green];

    pub(crate) fn keywords(self) -> &'static [&'static str] {
        match self {
            PriceSlot::Local => LOCAL_KEYWORDS,
            PriceSlot::Green => GREEN_KEYWORDS,
        }
    }
}

/// Maps label text to a slot. Local keywords are checked first, so
/// "Ökostrom beim Grundversorger" counts as local.
#[must_use]
pub fn classify_label(text: &str) -> Option<PriceSlot> {
    let lower = text.to_lowercase();
    PriceSlot::BOTH
        .into_iter()
        .find(|slot| slot.keywords().iter().any(|kw| lower.contains(kw)))
}

/// `true` for rows that must not feed a slot: overlong text or a competitor
/// brand mentioned as a whole word.
#[must_use]
pub fn is_comparison_row(row_text: &str) -> bool {
    row_text.chars().count() > MAX_ROW_CHARS || COMPETITOR_RE.is_match(row_text)
}

/// Regex alternation over a slot's keywords, longest first.
pub(crate) fn keyword_alternation(slot: PriceSlot) -> String {
    let mut keywords = slot.keywords().to_vec();
    keywords.sort_by_key(|kw| std::cmp::Reverse(kw.len()));
    keywords
        .iter()
        .map(|kw| regex::escape(kw).replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|")
}
