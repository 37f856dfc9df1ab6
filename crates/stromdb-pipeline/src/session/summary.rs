use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use stromdb_core::{ErrorCategory, OutlierSeverity};

/// Counts reported at the end of a run and stored with the session.
///
/// Carried in the checkpoint, so a run split over several invocations still
/// reports totals for the whole session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Targets for which a fetch was attempted.
    pub fetched: usize,
    /// `ORIGINAL` records written.
    pub persisted: usize,
    /// Targets skipped because the period already had a record for them.
    pub skipped_existing: usize,
    pub errors_by_category: BTreeMap<ErrorCategory, usize>,
    pub outliers_by_severity: BTreeMap<OutlierSeverity, usize>,
    pub fallback_persisted: usize,
    pub fallback_unresolved: usize,
}

impl RunSummary {
    pub(crate) fn record_error(&mut self, category: ErrorCategory) {
        *self.errors_by_category.entry(category).or_default() += 1;
    }

    pub(crate) fn record_outlier(&mut self, severity: OutlierSeverity) {
        *self.outliers_by_severity.entry(severity).or_default() += 1;
    }

    pub(crate) fn retract_error(&mut self, category: ErrorCategory) {
        decrement(&mut self.errors_by_category, category);
    }

    pub(crate) fn retract_outlier(&mut self, severity: OutlierSeverity) {
        decrement(&mut self.outliers_by_severity, severity);
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors_by_category.values().sum()
    }
}

fn decrement<K: Ord>(counts: &mut BTreeMap<K, usize>, key: K) {
    if let Some(count) = counts.get_mut(&key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(&key);
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fetched:             {}", self.fetched)?;
        writeln!(f, "persisted:           {}", self.persisted)?;
        writeln!(f, "skipped (existing):  {}", self.skipped_existing)?;
        writeln!(f, "errors:              {}", self.error_count())?;
        for (category, count) in &self.errors_by_category {
            writeln!(f, "  {:<18} {count}", category.as_str())?;
        }
        let outliers: usize = self.outliers_by_severity.values().sum();
        writeln!(f, "outliers:            {outliers}")?;
        for (severity, count) in &self.outliers_by_severity {
            writeln!(f, "  {:<18} {count}", severity.as_str())?;
        }
        writeln!(f, "fallback persisted:  {}", self.fallback_persisted)?;
        write!(f, "fallback unresolved: {}", self.fallback_unresolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_category_keys_as_strings() {
        let mut summary = RunSummary::default();
        summary.record_error(ErrorCategory::NotFound);
        summary.record_error(ErrorCategory::NotFound);
        summary.record_outlier(OutlierSeverity::Extreme);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["errors_by_category"]["not_found"], 2);
        assert_eq!(json["outliers_by_severity"]["extreme"], 1);

        let back: RunSummary = serde_json::from_value(json).unwrap();
        assert_eq!(back, summary);
        assert_eq!(back.error_count(), 2);
    }

    #[test]
    fn retracting_drops_emptied_keys() {
        let mut summary = RunSummary::default();
        summary.record_error(ErrorCategory::Timeout);
        summary.record_error(ErrorCategory::Timeout);
        summary.record_outlier(OutlierSeverity::High);

        summary.retract_error(ErrorCategory::Timeout);
        summary.retract_outlier(OutlierSeverity::High);
        summary.retract_outlier(OutlierSeverity::Extreme);

        assert_eq!(summary.errors_by_category[&ErrorCategory::Timeout], 1);
        assert!(summary.outliers_by_severity.is_empty());
    }
}
