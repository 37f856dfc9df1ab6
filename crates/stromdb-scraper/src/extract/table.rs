//! Table scanning: a flat regex pass over `<table>`/`<tr>`/`<td>` markup and
//! the four table-driven strategies built on it.

use std::sync::LazyLock;

use regex::Regex;
use stromdb_core::PriceBand;

use super::keywords::{classify_label, is_comparison_row};
use super::price::first_valid_price;
use super::text::inline_text;
use super::SlotValues;

static TABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<table\b[^>]*>(.*?)</table>").expect("valid regex"));
static ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<tr\b[^>]*>(.*?)</tr>").expect("valid regex"));
static CELL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(td|th)\b[^>]*>(.*?)</(?:td|th)>").expect("valid regex")
});
static TABLE_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<table\b").expect("valid regex"));
static ROW_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<tr\b").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Cell {
    pub header: bool,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Row {
    pub cells: Vec<Cell>,
}

impl Row {
    fn text(&self) -> String {
        self.cells
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    pub rows: Vec<Row>,
}

/// Counts of `<table>` and `<tr>` openings, used for city classification.
pub(crate) fn markup_counts(html: &str) -> (usize, usize) {
    (
        TABLE_OPEN_RE.find_iter(html).count(),
        ROW_OPEN_RE.find_iter(html).count(),
    )
}

/// Parses every non-nested table into rows of text cells.
pub(crate) fn parse_tables(html: &str) -> Vec<Table> {
    TABLE_RE
        .captures_iter(html)
        .map(|table| Table {
            rows: ROW_RE
                .captures_iter(&table[1])
                .map(|row| Row {
                    cells: CELL_RE
                        .captures_iter(&row[1])
                        .map(|cell| Cell {
                            header: cell[1].eq_ignore_ascii_case("th"),
                            text: inline_text(&cell[2]),
                        })
                        .collect(),
                })
                .filter(|row| !row.cells.is_empty())
                .collect(),
        })
        .collect()
}

/// Rows eligible to feed a slot, in document order.
fn candidate_rows(tables: &[Table]) -> impl Iterator<Item = &Row> {
    tables
        .iter()
        .flat_map(|t| t.rows.iter())
        .filter(|row| {
            let skip = is_comparison_row(&row.text());
            if skip {
                tracing::debug!(row = %row.text(), "skipping comparison row");
            }
            !skip
        })
}

/// Label in cell 0, value in cell 1.
pub(crate) fn simple_table(tables: &[Table], band: &PriceBand) -> SlotValues {
    let mut found = SlotValues::default();
    for row in candidate_rows(tables) {
        let [label, value, ..] = row.cells.as_slice() else {
            continue;
        };
        if let Some(slot) = classify_label(&label.text) {
            if let Some(price) = first_valid_price(&value.text, band) {
                found.offer(slot, price);
            }
        }
        if found.is_full() {
            break;
        }
    }
    found
}

/// Any label cell; the value is the cell immediately after it.
pub(crate) fn standard_table(tables: &[Table], band: &PriceBand) -> SlotValues {
    let mut found = SlotValues::default();
    for row in candidate_rows(tables) {
        for pair in row.cells.windows(2) {
            if let Some(slot) = classify_label(&pair[0].text) {
                if let Some(price) = first_valid_price(&pair[1].text, band) {
                    found.offer(slot, price);
                }
            }
        }
        if found.is_full() {
            break;
        }
    }
    found
}

/// [`standard_table`] over the first table only.
pub(crate) fn first_table(tables: &[Table], band: &PriceBand) -> SlotValues {
    standard_table(tables.get(..1).unwrap_or_default(), band)
}

/// `th` or `td` label cells; the value is the first later cell in the row
/// holding a plausible price.
pub(crate) fn complex_table(tables: &[Table], band: &PriceBand) -> SlotValues {
    let mut found = SlotValues::default();
    for row in candidate_rows(tables) {
        for (i, cell) in row.cells.iter().enumerate() {
            let Some(slot) = classify_label(&cell.text) else {
                continue;
            };
            let value = row.cells[i + 1..]
                .iter()
                .find_map(|c| first_valid_price(&c.text, band));
            if let Some(price) = value {
                found.offer(slot, price);
            }
        }
        if found.is_full() {
            break;
        }
    }
    found
}
