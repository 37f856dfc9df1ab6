//! Outlier assessment and record quality scoring.
//!
//! Both functions are pure. Outliers are flagged, never dropped: an extreme
//! price is still persisted with its severity so it can be reviewed later.

use stromdb_core::{OutlierAssessment, OutlierSeverity, OutlierThresholds, PriceBand, PriceRecord};

/// Relative gap between the two prices above which the pair is suspect.
const LARGE_DIFFERENCE: f64 = 1.0;
const EXTREME_DIFFERENCE: f64 = 2.0;

/// Score deduction for prices produced by a fallback-tier strategy.
const FALLBACK_TIER_PENALTY: f64 = 0.1;
/// Score deduction per price outside the plausibility band.
const OUT_OF_BAND_PENALTY: f64 = 0.5;

#[must_use]
pub fn price_severity(price: f64, thresholds: &OutlierThresholds) -> OutlierSeverity {
    if price > thresholds.extreme {
        OutlierSeverity::Extreme
    } else if price > thresholds.very_high {
        OutlierSeverity::VeryHigh
    } else if price > thresholds.high {
        OutlierSeverity::High
    } else {
        OutlierSeverity::Normal
    }
}

/// Checks each present price against the thresholds and the two prices
/// against each other.
#[must_use]
pub fn assess_outliers(
    local: Option<f64>,
    green: Option<f64>,
    thresholds: &OutlierThresholds,
) -> OutlierAssessment {
    let mut assessment = OutlierAssessment::default();

    for (label, price) in [("local provider", local), ("green energy", green)] {
        let Some(price) = price else { continue };
        let severity = price_severity(price, thresholds);
        if severity > OutlierSeverity::Normal {
            assessment.has_outlier = true;
            assessment.warnings.push(format!(
                "{label} price {price:.4} EUR/kWh is {severity}"
            ));
        }
        assessment.severity = assessment.severity.max(severity);
    }

    match (local, green) {
        (Some(a), Some(b)) => {
            let lower = a.min(b);
            if lower > 0.0 {
                let difference = (a - b).abs() / lower;
                if difference > EXTREME_DIFFERENCE {
                    assessment.has_outlier = true;
                    assessment.warnings.push(format!(
                        "extreme price difference: {:.0}%",
                        difference * 100.0
                    ));
                } else if difference > LARGE_DIFFERENCE {
                    assessment.has_outlier = true;
                    assessment.warnings.push(format!(
                        "large price difference: {:.0}%",
                        difference * 100.0
                    ));
                }
            }
        }
        (Some(_), None) => assessment
            .warnings
            .push("incomplete: green energy price missing".to_owned()),
        (None, Some(_)) => assessment
            .warnings
            .push("incomplete: local provider price missing".to_owned()),
        (None, None) => {}
    }

    assessment
}

/// Result of [`validate_record`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordValidation {
    pub valid: bool,
    pub quality_score: f64,
    pub issues: Vec<String>,
}

/// Scores a record: 1.0 minus 0.1 for a fallback-tier extraction and 0.5 per
/// price outside `band`, floored at 0. Out-of-band prices or a record without
/// prices make it invalid.
#[must_use]
pub fn validate_record(record: &PriceRecord, band: &PriceBand) -> RecordValidation {
    if !record.has_prices() {
        return RecordValidation {
            valid: false,
            quality_score: 0.0,
            issues: vec!["no prices extracted".to_owned()],
        };
    }

    let mut valid = true;
    let mut score = 1.0;
    let mut issues = Vec::new();

    if record.extraction_method.is_fallback_tier() {
        score -= FALLBACK_TIER_PENALTY;
        issues.push(format!(
            "fallback-tier extraction method {}",
            record.extraction_method
        ));
    }

    for (label, price) in [
        ("local provider", record.local_provider_price),
        ("green energy", record.green_energy_price),
    ] {
        if let Some(price) = price.filter(|p| !band.contains(*p)) {
            valid = false;
            score -= OUT_OF_BAND_PENALTY;
            issues.push(format!(
                "{label} price {price:.4} outside plausible range {:.2}-{:.2}",
                band.min, band.max
            ));
        }
    }

    RecordValidation {
        valid,
        quality_score: f64::max(score, 0.0),
        issues,
    }
}
