use stromdb_core::{PriceBand, Strategy};

use super::table::{self, Table};
use super::{pattern, CityClass, SlotValues};

/// Parsed views of one page, shared by every strategy.
pub(crate) struct PageView<'a> {
    pub text: &'a str,
    pub tables: Vec<Table>,
}

/// Strategy order for a city class.
#[must_use]
pub fn strategies_for(class: CityClass) -> &'static [Strategy] {
    match class {
        CityClass::Small => &[Strategy::SimpleRegex, Strategy::SimpleTable],
        CityClass::Medium => &[
            Strategy::StandardTable,
            Strategy::StandardRegex,
            Strategy::FirstTable,
        ],
        CityClass::Large => &[
            Strategy::ComplexTable,
            Strategy::AdvancedRegex,
            Strategy::StandardTable,
        ],
    }
}

pub(crate) fn run(strategy: Strategy, page: &PageView<'_>, band: &PriceBand) -> SlotValues {
    match strategy {
        Strategy::SimpleTable => table::simple_table(&page.tables, band),
        Strategy::StandardTable => table::standard_table(&page.tables, band),
        Strategy::FirstTable => table::first_table(&page.tables, band),
        Strategy::ComplexTable => table::complex_table(&page.tables, band),
        Strategy::SimpleRegex => pattern::simple_regex(page.text, band),
        Strategy::StandardRegex => pattern::standard_regex(page.text, band),
        Strategy::AdvancedRegex => pattern::advanced_regex(page.text, band),
    }
}
