//! Domain types shared by extraction, validation, fallback and storage.
//!
//! Everything here is plain data: the only behaviour is derivation of
//! dependent fields (`average_price`, `normalized_name`) and the persistence
//! guard [`PriceRecord::ensure_persistable`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::CoreError;

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

/// WGS84 coordinates in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Returns `true` when both components are finite and inside their
    /// geographic ranges.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// One place to be priced. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Postal-code-like identifier, e.g. `"20095"`.
    pub location_id: String,
    pub display_name: String,
    /// URL path segment used to build the source page address, e.g. `"muenchen"`.
    pub normalized_name: String,
    pub coordinates: Option<Coordinates>,
}

impl Target {
    /// Builds a target, deriving `normalized_name` from `display_name`.
    #[must_use]
    pub fn new(location_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        Self {
            location_id: location_id.into(),
            normalized_name: normalize_name(&display_name),
            display_name,
            coordinates: None,
        }
    }

    #[must_use]
    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.coordinates = Some(Coordinates::new(latitude, longitude));
        self
    }
}

/// Converts a display name into the URL-safe form the source uses.
///
/// Lowercases, transliterates German umlauts and `ß`, and collapses every run
/// of non-alphanumeric characters into a single `-`.
#[must_use]
pub fn normalize_name(display_name: &str) -> String {
    let mut transliterated = String::with_capacity(display_name.len());
    for c in display_name.trim().to_lowercase().chars() {
        match c {
            'ä' => transliterated.push_str("ae"),
            'ö' => transliterated.push_str("oe"),
            'ü' => transliterated.push_str("ue"),
            'ß' => transliterated.push_str("ss"),
            c if c.is_ascii_alphanumeric() => transliterated.push(c),
            _ => transliterated.push(' '),
        }
    }
    transliterated
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

// ---------------------------------------------------------------------------
// Period
// ---------------------------------------------------------------------------

/// Reporting month a price record belongs to, rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidPeriod`] if `month` is not in `1..=12` or
    /// the year is outside the supported range.
    pub fn new(year: i32, month: u32) -> Result<Self, CoreError> {
        if !(2000..=2100).contains(&year) || NaiveDate::from_ymd_opt(year, month, 1).is_none() {
            return Err(CoreError::InvalidPeriod(format!("{year}-{month}")));
        }
        Ok(Self { year, month })
    }

    /// The month containing `now`.
    #[must_use]
    pub fn containing(now: DateTime<Utc>) -> Self {
        Self {
            year: now.year(),
            month: now.month(),
        }
    }

    #[must_use]
    pub fn year(&self) -> i32 {
        self.year
    }

    #[must_use]
    pub fn month(&self) -> u32 {
        self.month
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidPeriod(s.to_string());
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month).map_err(|_| invalid())
    }
}

impl TryFrom<String> for Period {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.to_string()
    }
}

// ---------------------------------------------------------------------------
// Enumerations persisted as text
// ---------------------------------------------------------------------------

/// Provenance of a [`PriceRecord`]. Only `Original` and `Fallback` are ever
/// persisted; the other two describe per-target outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSource {
    Original,
    Fallback,
    NotFound,
    Error,
}

impl DataSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Original => "ORIGINAL",
            DataSource::Fallback => "FALLBACK",
            DataSource::NotFound => "NOT_FOUND",
            DataSource::Error => "ERROR",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ORIGINAL" => Ok(DataSource::Original),
            "FALLBACK" => Ok(DataSource::Fallback),
            "NOT_FOUND" => Ok(DataSource::NotFound),
            "ERROR" => Ok(DataSource::Error),
            other => Err(CoreError::UnknownValue {
                kind: "data source",
                value: other.to_string(),
            }),
        }
    }
}

/// Outlier severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OutlierSeverity {
    #[default]
    Normal,
    High,
    VeryHigh,
    Extreme,
}

impl OutlierSeverity {
    pub const ALL: [OutlierSeverity; 4] = [
        OutlierSeverity::Normal,
        OutlierSeverity::High,
        OutlierSeverity::VeryHigh,
        OutlierSeverity::Extreme,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OutlierSeverity::Normal => "normal",
            OutlierSeverity::High => "high",
            OutlierSeverity::VeryHigh => "very_high",
            OutlierSeverity::Extreme => "extreme",
        }
    }
}

impl fmt::Display for OutlierSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutlierSeverity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|sev| sev.as_str() == s)
            .ok_or_else(|| CoreError::UnknownValue {
                kind: "outlier severity",
                value: s.to_string(),
            })
    }
}

/// Result of screening a price pair against the outlier thresholds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutlierAssessment {
    pub has_outlier: bool,
    pub severity: OutlierSeverity,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Extraction provenance
// ---------------------------------------------------------------------------

/// A named extraction strategy. Dispatch happens by `match` in the scraper's
/// extraction engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    SimpleRegex,
    SimpleTable,
    StandardTable,
    StandardRegex,
    FirstTable,
    ComplexTable,
    AdvancedRegex,
}

/// Confidence tier of a strategy. Fallback-tier results cost quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyTier {
    Primary,
    Fallback,
}

impl Strategy {
    pub const ALL: [Strategy; 7] = [
        Strategy::SimpleRegex,
        Strategy::SimpleTable,
        Strategy::StandardTable,
        Strategy::StandardRegex,
        Strategy::FirstTable,
        Strategy::ComplexTable,
        Strategy::AdvancedRegex,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::SimpleRegex => "simple_regex",
            Strategy::SimpleTable => "simple_table",
            Strategy::StandardTable => "standard_table",
            Strategy::StandardRegex => "standard_regex",
            Strategy::FirstTable => "first_table",
            Strategy::ComplexTable => "complex_table",
            Strategy::AdvancedRegex => "advanced_regex",
        }
    }

    /// `true` for strategies that read `<table>` markup rather than page text.
    #[must_use]
    pub fn is_table(&self) -> bool {
        matches!(
            self,
            Strategy::SimpleTable
                | Strategy::StandardTable
                | Strategy::FirstTable
                | Strategy::ComplexTable
        )
    }

    #[must_use]
    pub fn tier(&self) -> StrategyTier {
        match self {
            Strategy::SimpleTable | Strategy::StandardTable | Strategy::ComplexTable => {
                StrategyTier::Primary
            }
            Strategy::FirstTable
            | Strategy::SimpleRegex
            | Strategy::StandardRegex
            | Strategy::AdvancedRegex => StrategyTier::Fallback,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| CoreError::UnknownValue {
                kind: "strategy",
                value: s.to_string(),
            })
    }
}

/// Which strategy (or pair of strategies) produced a record's prices.
///
/// Rendered as `"standard_table"`, `"standard_table+standard_regex"` (local
/// slot first) or `"failed"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMethod {
    Single(Strategy),
    Mixed { local: Strategy, green: Strategy },
    Failed,
}

impl ExtractionMethod {
    /// Builds the method from the strategies that filled each slot.
    #[must_use]
    pub fn from_slots(local: Option<Strategy>, green: Option<Strategy>) -> Self {
        match (local, green) {
            (Some(l), Some(g)) if l == g => ExtractionMethod::Single(l),
            (Some(local), Some(green)) => ExtractionMethod::Mixed { local, green },
            (Some(s), None) | (None, Some(s)) => ExtractionMethod::Single(s),
            (None, None) => ExtractionMethod::Failed,
        }
    }

    #[must_use]
    pub fn strategies(&self) -> Vec<Strategy> {
        match *self {
            ExtractionMethod::Single(s) => vec![s],
            ExtractionMethod::Mixed { local, green } => vec![local, green],
            ExtractionMethod::Failed => Vec::new(),
        }
    }

    /// `true` when any contributing strategy sits in the fallback tier.
    #[must_use]
    pub fn is_fallback_tier(&self) -> bool {
        self.strategies()
            .iter()
            .any(|s| s.tier() == StrategyTier::Fallback)
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, ExtractionMethod::Failed)
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionMethod::Single(s) => f.write_str(s.as_str()),
            ExtractionMethod::Mixed { local, green } => write!(f, "{local}+{green}"),
            ExtractionMethod::Failed => f.write_str("failed"),
        }
    }
}

impl FromStr for ExtractionMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "failed" {
            return Ok(ExtractionMethod::Failed);
        }
        match s.split_once('+') {
            Some((local, green)) => Ok(ExtractionMethod::from_slots(
                Some(local.parse()?),
                Some(green.parse()?),
            )),
            None => Ok(ExtractionMethod::Single(s.parse()?)),
        }
    }
}

impl Serialize for ExtractionMethod {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExtractionMethod {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Price records
// ---------------------------------------------------------------------------

/// Mean of whichever prices are present.
#[must_use]
pub fn average_price(local: Option<f64>, green: Option<f64>) -> Option<f64> {
    match (local, green) {
        (Some(a), Some(b)) => Some((a + b) / 2.0),
        (Some(a), None) | (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

/// The persisted unit: one row per `(period, location_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub location_id: String,
    pub period: Period,
    /// EUR per kWh.
    pub local_provider_price: Option<f64>,
    /// EUR per kWh.
    pub green_energy_price: Option<f64>,
    pub average_price: Option<f64>,
    pub source: DataSource,
    /// Donor location for `FALLBACK` records.
    pub source_location_id: Option<String>,
    pub distance_km: f64,
    pub coordinates: Option<Coordinates>,
    pub outlier: OutlierAssessment,
    pub extraction_method: ExtractionMethod,
    pub raw_source_url: String,
}

impl PriceRecord {
    /// Builds an `ORIGINAL` record with a derived average and zero distance.
    #[must_use]
    pub fn original(
        target: &Target,
        period: Period,
        local_provider_price: Option<f64>,
        green_energy_price: Option<f64>,
        extraction_method: ExtractionMethod,
        raw_source_url: impl Into<String>,
    ) -> Self {
        Self {
            location_id: target.location_id.clone(),
            period,
            local_provider_price,
            green_energy_price,
            average_price: average_price(local_provider_price, green_energy_price),
            source: DataSource::Original,
            source_location_id: None,
            distance_km: 0.0,
            coordinates: target.coordinates,
            outlier: OutlierAssessment::default(),
            extraction_method,
            raw_source_url: raw_source_url.into(),
        }
    }

    #[must_use]
    pub fn has_prices(&self) -> bool {
        self.local_provider_price.is_some() || self.green_energy_price.is_some()
    }

    /// Checks the invariants every stored record must satisfy.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidRecord`] when both prices are missing, the
    /// source is not persistable, or `distance_km` contradicts the source.
    pub fn ensure_persistable(&self) -> Result<(), CoreError> {
        let reject = |reason: &str| CoreError::InvalidRecord {
            location_id: self.location_id.clone(),
            reason: reason.to_string(),
        };

        if !self.has_prices() {
            return Err(reject("record has neither a local nor a green price"));
        }
        match self.source {
            DataSource::Original if self.distance_km != 0.0 => {
                Err(reject("ORIGINAL record must have distance_km == 0"))
            }
            DataSource::Fallback if self.distance_km <= 0.0 => {
                Err(reject("FALLBACK record must have distance_km > 0"))
            }
            DataSource::Fallback if self.source_location_id.is_none() => {
                Err(reject("FALLBACK record must name its source location"))
            }
            DataSource::NotFound | DataSource::Error => {
                Err(reject("only ORIGINAL and FALLBACK records are stored"))
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Error log entries
// ---------------------------------------------------------------------------

/// Category of a per-target failure recorded in the error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NotFound,
    Blocked,
    Timeout,
    Network,
    Unknown,
    InvalidPage,
    ExtractionFailed,
    ValidationFailed,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Blocked => "blocked",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Network => "network",
            ErrorCategory::Unknown => "unknown",
            ErrorCategory::InvalidPage => "invalid_page",
            ErrorCategory::ExtractionFailed => "extraction_failed",
            ErrorCategory::ValidationFailed => "validation_failed",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a session's error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub location_id: String,
    pub period: Period,
    pub category: ErrorCategory,
    pub message: String,
    pub attempts: u32,
    pub url: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Target {
        Target::new("20095", "Hamburg").with_coordinates(53.5511, 9.9937)
    }

    #[test]
    fn normalize_name_transliterates_umlauts() {
        assert_eq!(normalize_name("München"), "muenchen");
        assert_eq!(normalize_name("Gießen"), "giessen");
        assert_eq!(normalize_name("Frankfurt am Main"), "frankfurt-am-main");
        assert_eq!(normalize_name("  Halle (Saale) "), "halle-saale");
    }

    #[test]
    fn period_parses_and_displays() {
        let period: Period = "2025-03".parse().unwrap();
        assert_eq!(period.year(), 2025);
        assert_eq!(period.month(), 3);
        assert_eq!(period.to_string(), "2025-03");
    }

    #[test]
    fn period_rejects_malformed_input() {
        for raw in ["2025-13", "2025-3", "25-03", "2025/03", "", "2025-00", "abcd-ef"] {
            assert!(raw.parse::<Period>().is_err(), "expected {raw:?} to fail");
        }
    }

    #[test]
    fn period_serde_uses_string_form() {
        let period: Period = "2024-11".parse().unwrap();
        let json = serde_json::to_string(&period).unwrap();
        assert_eq!(json, "\"2024-11\"");
        let back: Period = serde_json::from_str(&json).unwrap();
        assert_eq!(back, period);
    }

    #[test]
    fn average_of_both_prices() {
        let avg = average_price(Some(0.42), Some(0.27)).unwrap();
        assert!((avg - 0.345).abs() < 1e-9);
    }

    #[test]
    fn average_of_single_price() {
        assert_eq!(average_price(None, Some(0.3)), Some(0.3));
        assert_eq!(average_price(None, None), None);
    }

    #[test]
    fn severity_orders_by_badness() {
        assert!(OutlierSeverity::Extreme > OutlierSeverity::VeryHigh);
        assert!(OutlierSeverity::VeryHigh > OutlierSeverity::High);
        assert!(OutlierSeverity::High > OutlierSeverity::Normal);
        assert_eq!(
            "very_high".parse::<OutlierSeverity>().unwrap(),
            OutlierSeverity::VeryHigh
        );
    }

    #[test]
    fn extraction_method_display_and_parse() {
        let mixed = ExtractionMethod::from_slots(
            Some(Strategy::StandardTable),
            Some(Strategy::StandardRegex),
        );
        assert_eq!(mixed.to_string(), "standard_table+standard_regex");
        assert_eq!(mixed.to_string().parse::<ExtractionMethod>().unwrap(), mixed);
        assert_eq!(
            ExtractionMethod::from_slots(Some(Strategy::SimpleTable), None),
            ExtractionMethod::Single(Strategy::SimpleTable)
        );
        assert_eq!(
            "failed".parse::<ExtractionMethod>().unwrap(),
            ExtractionMethod::Failed
        );
        assert!("bogus".parse::<ExtractionMethod>().is_err());
    }

    #[test]
    fn fallback_tier_detection() {
        assert!(!ExtractionMethod::Single(Strategy::ComplexTable).is_fallback_tier());
        assert!(ExtractionMethod::Single(Strategy::FirstTable).is_fallback_tier());
        assert!(ExtractionMethod::Mixed {
            local: Strategy::StandardTable,
            green: Strategy::AdvancedRegex
        }
        .is_fallback_tier());
    }

    #[test]
    fn original_record_derives_average_and_zero_distance() {
        let record = PriceRecord::original(
            &target(),
            "2025-01".parse().unwrap(),
            Some(0.42),
            Some(0.27),
            ExtractionMethod::Single(Strategy::StandardTable),
            "https://example.test/hamburg",
        );
        assert_eq!(record.source, DataSource::Original);
        assert!(record.distance_km.abs() < f64::EPSILON);
        assert!((record.average_price.unwrap() - 0.345).abs() < 1e-9);
        assert!(record.ensure_persistable().is_ok());
    }

    #[test]
    fn record_without_prices_is_not_persistable() {
        let record = PriceRecord::original(
            &target(),
            "2025-01".parse().unwrap(),
            None,
            None,
            ExtractionMethod::Failed,
            "https://example.test/hamburg",
        );
        assert!(matches!(
            record.ensure_persistable(),
            Err(CoreError::InvalidRecord { .. })
        ));
    }

    #[test]
    fn fallback_record_requires_positive_distance() {
        let mut record = PriceRecord::original(
            &target(),
            "2025-01".parse().unwrap(),
            Some(0.4),
            None,
            ExtractionMethod::Single(Strategy::SimpleTable),
            "https://example.test/hamburg",
        );
        record.source = DataSource::Fallback;
        record.source_location_id = Some("20097".to_string());
        assert!(record.ensure_persistable().is_err());
        record.distance_km = 3.2;
        assert!(record.ensure_persistable().is_ok());
    }
}
