//! Price extraction from fetched source pages.
//!
//! Pages come from one template family but vary with the size of the place:
//! small towns get a sentence or a two-row table, large cities get several
//! comparison tables. [`extract`] classifies the page, runs the strategies
//! for that class in order and keeps the first plausible value per slot.
//! It never fails; a page with nothing usable yields
//! [`ExtractionMethod::Failed`].

mod keywords;
mod pattern;
mod price;
mod strategy;
mod table;
mod text;

use serde::Serialize;
use stromdb_core::{average_price, ExtractionMethod, PriceBand, Strategy};

use crate::error::PageError;

pub use keywords::{classify_label, is_comparison_row, PriceSlot};
pub use price::{detect_unit, first_valid_price, normalize_price, parse_number, PriceExpression, PriceUnit};
pub use strategy::strategies_for;
pub use text::page_text;

use strategy::PageView;

/// Pages whose visible text is shorter than this are error or placeholder pages.
const MIN_PAGE_TEXT_CHARS: usize = 50;

/// Share by which the green price may exceed the local one before the two
/// are assumed to be swapped on the page.
const SWAP_TOLERANCE: f64 = 0.10;

/// Page layout class, derived from table markup volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CityClass {
    Small,
    Medium,
    Large,
}

/// Where the extracted values came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageFormat {
    Table,
    Text,
    Mixed,
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    pub local_provider_price: Option<f64>,
    pub green_energy_price: Option<f64>,
    pub average_price: Option<f64>,
    pub method: ExtractionMethod,
    pub format_detected: PageFormat,
    pub city_class: CityClass,
    pub diagnostics: Vec<String>,
}

impl ExtractionResult {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.method.is_failed()
    }
}

/// Per-strategy output: the first plausible price for each slot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct SlotValues {
    pub local: Option<f64>,
    pub green: Option<f64>,
}

impl SlotValues {
    /// Sets `slot` unless it already holds a value.
    pub(crate) fn offer(&mut self, slot: PriceSlot, price: f64) {
        let entry = match slot {
            PriceSlot::Local => &mut self.local,
            PriceSlot::Green => &mut self.green,
        };
        if entry.is_none() {
            *entry = Some(price);
        }
    }

    pub(crate) fn get(&self, slot: PriceSlot) -> Option<f64> {
        match slot {
            PriceSlot::Local => self.local,
            PriceSlot::Green => self.green,
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.local.is_some() && self.green.is_some()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.local.is_none() && self.green.is_none()
    }
}

/// `large` when tables ≥ 4 or rows ≥ 40; `small` when tables ≤ 1 and
/// rows ≤ 8; `medium` otherwise.
#[must_use]
pub fn classify_city(table_count: usize, row_count: usize) -> CityClass {
    if table_count >= 4 || row_count >= 40 {
        CityClass::Large
    } else if table_count <= 1 && row_count <= 8 {
        CityClass::Small
    } else {
        CityClass::Medium
    }
}

/// Rejects pages that cannot hold a price before extraction runs.
///
/// # Errors
///
/// Returns a [`PageError`] describing why the page is unusable.
pub fn check_page(html: &str, text: &str) -> Result<(), PageError> {
    if html.trim().is_empty() {
        return Err(PageError::Empty);
    }
    let chars = text.chars().count();
    if chars < MIN_PAGE_TEXT_CHARS {
        return Err(PageError::TooShort { chars });
    }
    if !price::has_price_expression(text) {
        return Err(PageError::NoPriceContent);
    }
    Ok(())
}

/// Extracts both price slots from `html`; `text` is its [`page_text`].
#[must_use]
pub fn extract(html: &str, text: &str, band: &PriceBand) -> ExtractionResult {
    let (table_count, row_count) = table::markup_counts(html);
    let city_class = classify_city(table_count, row_count);
    let page = PageView {
        text,
        tables: table::parse_tables(html),
    };

    let mut diagnostics = vec![format!(
        "city class {city_class:?} (tables={table_count}, rows={row_count})"
    )];
    let mut local: Option<(f64, Strategy)> = None;
    let mut green: Option<(f64, Strategy)> = None;

    for &strategy in strategies_for(city_class) {
        let values = strategy::run(strategy, &page, band);
        tracing::debug!(
            %strategy,
            local = ?values.local,
            green = ?values.green,
            "extraction strategy finished"
        );
        if local.is_none() {
            local = values.local.map(|v| (v, strategy));
        }
        if green.is_none() {
            green = values.green.map(|v| (v, strategy));
        }
        if local.is_some() && green.is_some() {
            break;
        }
    }

    let local_strategy = local.map(|(_, s)| s);
    let green_strategy = green.map(|(_, s)| s);
    let format_detected = detect_format(&[local_strategy, green_strategy]);
    let method = ExtractionMethod::from_slots(local_strategy, green_strategy);
    if method.is_failed() {
        diagnostics.push("no strategy produced a plausible price".to_owned());
    }

    let local_provider_price = local.map(|(v, _)| v);
    let green_energy_price = green.map(|(v, _)| v);
    let mut result = ExtractionResult {
        local_provider_price,
        green_energy_price,
        average_price: average_price(local_provider_price, green_energy_price),
        method,
        format_detected,
        city_class,
        diagnostics,
    };
    correct_price_logic(&mut result);
    result
}

fn detect_format(contributors: &[Option<Strategy>]) -> PageFormat {
    let used: Vec<Strategy> = contributors.iter().flatten().copied().collect();
    if used.is_empty() {
        PageFormat::None
    } else if used.iter().all(Strategy::is_table) {
        PageFormat::Table
    } else if used.iter().any(Strategy::is_table) {
        PageFormat::Mixed
    } else {
        PageFormat::Text
    }
}

/// Swaps the two slots when the green price exceeds the local one by more
/// than 10% of the green price. Returns whether a swap happened.
///
/// Idempotent: after a swap the local price is the higher one, so a second
/// call leaves the result unchanged.
pub fn correct_price_logic(result: &mut ExtractionResult) -> bool {
    let (Some(local), Some(green)) = (result.local_provider_price, result.green_energy_price)
    else {
        return false;
    };
    if green <= 0.0 || (green - local) / green <= SWAP_TOLERANCE {
        return false;
    }

    result.local_provider_price = Some(green);
    result.green_energy_price = Some(local);
    if let ExtractionMethod::Mixed { local, green } = result.method {
        result.method = ExtractionMethod::Mixed {
            local: green,
            green: local,
        };
    }
    result.diagnostics.push(format!(
        "swapped prices: green {green} exceeded local {local} by more than {:.0}%",
        SWAP_TOLERANCE * 100.0
    ));
    tracing::debug!(local, green, "swapped local and green prices");
    true
}

#[cfg(test)]
#[path = "extract_test.rs"]
mod tests;
