//! Keyword-then-price patterns over visible page text.

use std::sync::LazyLock;

use regex::Regex;
use stromdb_core::PriceBand;

use super::keywords::{keyword_alternation, PriceSlot};
use super::price::{expression_from_parts, normalize_price, PRICE_PATTERN};
use super::SlotValues;

/// One compiled pattern per slot.
struct SlotPatterns {
    local: Regex,
    green: Regex,
}

impl SlotPatterns {
    fn build(make: impl Fn(&str) -> String) -> Self {
        let compile = |slot| {
            let pattern = make(&keyword_alternation(slot));
            Regex::new(&format!("(?i){pattern}")).expect("valid regex")
        };
        Self {
            local: compile(PriceSlot::Local),
            green: compile(PriceSlot::Green),
        }
    }

    fn get(&self, slot: PriceSlot) -> &Regex {
        match slot {
            PriceSlot::Local => &self.local,
            PriceSlot::Green => &self.green,
        }
    }
}

static SIMPLE: LazyLock<SlotPatterns> =
    LazyLock::new(|| SlotPatterns::build(|kw| format!(r"(?:{kw})[^\n]{{0,60}}?{PRICE_PATTERN}")));
static STANDARD: LazyLock<SlotPatterns> =
    LazyLock::new(|| SlotPatterns::build(|kw| format!(r"(?:{kw})[\s\S]{{0,120}}?{PRICE_PATTERN}")));
static ADVANCED: LazyLock<SlotPatterns> =
    LazyLock::new(|| SlotPatterns::build(|kw| format!(r"(?:{kw})[\s\S]{{0,200}}?{PRICE_PATTERN}")));
static ADVANCED_REVERSE: LazyLock<SlotPatterns> =
    LazyLock::new(|| SlotPatterns::build(|kw| format!(r"{PRICE_PATTERN}[\s\S]{{0,200}}?(?:{kw})")));

/// First in-band price matched by `re`. The pattern's first two groups are
/// the number and the unit.
fn first_match(re: &Regex, text: &str, band: &PriceBand) -> Option<f64> {
    re.captures_iter(text).find_map(|caps| {
        let expr = expression_from_parts(caps.get(1)?.as_str(), caps.get(2).map(|m| m.as_str()))?;
        normalize_price(expr, band)
    })
}

fn scan(patterns: &SlotPatterns, text: &str, band: &PriceBand, found: &mut SlotValues) {
    for slot in PriceSlot::BOTH {
        if found.get(slot).is_none() {
            if let Some(price) = first_match(patterns.get(slot), text, band) {
                found.offer(slot, price);
            }
        }
    }
}

/// Keyword and price on the same line, at most 60 characters apart.
pub(crate) fn simple_regex(text: &str, band: &PriceBand) -> SlotValues {
    let mut found = SlotValues::default();
    scan(&SIMPLE, text, band, &mut found);
    found
}

/// Keyword and price up to 120 characters apart, across line breaks.
pub(crate) fn standard_regex(text: &str, band: &PriceBand) -> SlotValues {
    let mut found = SlotValues::default();
    scan(&STANDARD, text, band, &mut found);
    found
}

/// Up to 200 characters apart, then price-before-keyword for slots still empty.
pub(crate) fn advanced_regex(text: &str, band: &PriceBand) -> SlotValues {
    let mut found = SlotValues::default();
    scan(&ADVANCED, text, band, &mut found);
    if !found.is_full() {
        scan(&ADVANCED_REVERSE, text, band, &mut found);
    }
    found
}
