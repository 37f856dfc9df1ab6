//! Per-kWh price expressions and their normalization to EUR/kWh.

use std::sync::LazyLock;

use regex::Regex;
use stromdb_core::PriceBand;

/// Number, optional unit, then a per-kWh marker: `38,00 Cent pro kWh`,
/// `0.38 €/kWh`, `38 ct je kWh`.
pub(crate) const PRICE_PATTERN: &str =
    r"(\d{1,4}(?:[.,]\d{1,4})?)\s*(ct\.?|cents?|€|eur|euro)?\s*(?:/|pro|je|per)\s*kwh";

static PRICE_EXPR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("(?i){PRICE_PATTERN}")).expect("valid regex"));

/// Raw magnitude above which a unit-less number is read as cents.
const IMPLICIT_SUBUNIT_THRESHOLD: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceUnit {
    Euro,
    Cent,
    Unspecified,
}

/// A price literal as written on the page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceExpression {
    pub raw: f64,
    pub unit: PriceUnit,
}

impl PriceExpression {
    /// Converts to EUR/kWh, dividing by 100 for cents (explicit, or implied
    /// by a unit-less magnitude above 10).
    #[must_use]
    pub fn to_euro(&self) -> f64 {
        let euros = match self.unit {
            PriceUnit::Cent => self.raw / 100.0,
            PriceUnit::Unspecified if self.raw > IMPLICIT_SUBUNIT_THRESHOLD => self.raw / 100.0,
            PriceUnit::Euro | PriceUnit::Unspecified => self.raw,
        };
        round4(euros)
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Parses a decimal literal using either `,` or `.` as separator.
#[must_use]
pub fn parse_number(literal: &str) -> Option<f64> {
    let value = literal.trim().replace(',', ".").parse::<f64>().ok()?;
    value.is_finite().then_some(value)
}

#[must_use]
pub fn detect_unit(token: Option<&str>) -> PriceUnit {
    let Some(token) = token else {
        return PriceUnit::Unspecified;
    };
    let lower = token.trim().trim_end_matches('.').to_lowercase();
    match lower.as_str() {
        "ct" | "cent" | "cents" => PriceUnit::Cent,
        "€" | "eur" | "euro" => PriceUnit::Euro,
        _ => PriceUnit::Unspecified,
    }
}

/// Builds an expression from the number and unit capture groups of
/// [`PRICE_PATTERN`].
pub(crate) fn expression_from_parts(number: &str, unit: Option<&str>) -> Option<PriceExpression> {
    Some(PriceExpression {
        raw: parse_number(number)?,
        unit: detect_unit(unit),
    })
}

/// Every per-kWh price expression in `text`, left to right.
pub(crate) fn price_expressions(text: &str) -> impl Iterator<Item = PriceExpression> + '_ {
    PRICE_EXPR_RE.captures_iter(text).filter_map(|caps| {
        expression_from_parts(caps.get(1)?.as_str(), caps.get(2).map(|m| m.as_str()))
    })
}

/// `true` when `text` contains at least one per-kWh price expression.
pub(crate) fn has_price_expression(text: &str) -> bool {
    PRICE_EXPR_RE.is_match(text)
}

/// First price expression in `text` whose normalized value lies in `band`.
#[must_use]
pub fn first_valid_price(text: &str, band: &PriceBand) -> Option<f64> {
    price_expressions(text)
        .map(|expr| expr.to_euro())
        .find(|value| band.contains(*value))
}

/// Normalizes an expression and applies the plausibility band.
#[must_use]
pub fn normalize_price(expr: PriceExpression, band: &PriceBand) -> Option<f64> {
    let value = expr.to_euro();
    band.contains(value).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn cent_pro_kwh_converts_to_euro() {
        let value = first_valid_price("38,00 Cent pro kWh", &PriceBand::default()).unwrap();
        assert!(approx(value, 0.38), "got {value}");
    }

    #[test]
    fn euro_per_kwh_is_kept() {
        let value = first_valid_price("0,3190 €/kWh", &PriceBand::default()).unwrap();
        assert!(approx(value, 0.319), "got {value}");
    }

    #[test]
    fn ct_abbreviation_with_dot() {
        let value = first_valid_price("32.5 ct./kWh", &PriceBand::default()).unwrap();
        assert!(approx(value, 0.325), "got {value}");
    }

    #[test]
    fn unitless_large_number_is_implicit_cents() {
        let value = first_valid_price("41,2 pro kWh", &PriceBand::default()).unwrap();
        assert!(approx(value, 0.412), "got {value}");
    }

    #[test]
    fn unitless_small_number_is_euros() {
        let value = first_valid_price("0,41 je kWh", &PriceBand::default()).unwrap();
        assert!(approx(value, 0.41), "got {value}");
    }

    #[test]
    fn out_of_band_values_are_skipped() {
        // 250 €/kWh is implausible; the second expression is accepted.
        let value =
            first_valid_price("250 €/kWh oder 29 ct/kWh", &PriceBand::default()).unwrap();
        assert!(approx(value, 0.29), "got {value}");
    }

    #[test]
    fn no_kwh_marker_means_no_price() {
        assert!(first_valid_price("38,00 Cent", &PriceBand::default()).is_none());
        assert!(!has_price_expression("Grundgebühr 12,50 € pro Monat"));
    }

    #[test]
    fn detect_unit_variants() {
        assert_eq!(detect_unit(Some("Cent")), PriceUnit::Cent);
        assert_eq!(detect_unit(Some("ct.")), PriceUnit::Cent);
        assert_eq!(detect_unit(Some("EUR")), PriceUnit::Euro);
        assert_eq!(detect_unit(Some("€")), PriceUnit::Euro);
        assert_eq!(detect_unit(None), PriceUnit::Unspecified);
    }

    #[test]
    fn normalize_respects_band() {
        let band = PriceBand { min: 0.1, max: 0.5 };
        let expr = PriceExpression {
            raw: 60.0,
            unit: PriceUnit::Cent,
        };
        assert!(normalize_price(expr, &band).is_none());
        let expr = PriceExpression {
            raw: 30.0,
            unit: PriceUnit::Cent,
        };
        assert!(approx(normalize_price(expr, &band).unwrap(), 0.3));
    }
}
