//! Normalization and validation of parsed bulletins
//!
//! Runs between the parser and the repository. Enforces the status and
//! priority-date invariants, collapses duplicate rows, rejects implausible
//! dates and applies the quality gate that quarantines bad bulletins.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::bulletin::{Bulletin, CategoryEntry, Chart, Country, EntryStatus, VisaCategory};
use crate::domain::constants::MAX_DRIFT_YEARS;

use super::parsing::ParsedBulletin;

/// Per-bulletin quality accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub rows_in: usize,
    pub rows_out: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub date_parse_rate: f64,
}

/// A bulletin that passed the gates and is ready to persist.
#[derive(Debug, Clone)]
pub struct NormalizedBulletin {
    pub bulletin: Bulletin,
    pub entries: Vec<CategoryEntry>,
    pub report: QualityReport,
}

/// Outcome of the normalization stage.
#[derive(Debug, Clone)]
pub enum NormalizeOutcome {
    Ready(NormalizedBulletin),
    Quarantined {
        bulletin: Bulletin,
        reason: String,
        report: QualityReport,
    },
}

pub const QUARANTINE_LOW_PARSE_RATE: &str = "date_parse_rate_below_floor";
pub const QUARANTINE_NO_ENTRIES: &str = "no_valid_entries";

/// Apply invariants and quality gates to one parsed bulletin.
pub fn normalize(parsed: ParsedBulletin, min_date_parse_rate: f64) -> NormalizeOutcome {
    let rows_in = parsed.entries.len();
    let date_parse_rate = parsed.date_parse_rate();
    let mut warnings = parsed.warnings.clone();
    let mut errors: Vec<String> = Vec::new();

    if date_parse_rate < min_date_parse_rate {
        let report = QualityReport {
            rows_in,
            rows_out: 0,
            warnings,
            errors,
            date_parse_rate,
        };
        return NormalizeOutcome::Quarantined {
            bulletin: parsed.bulletin,
            reason: QUARANTINE_LOW_PARSE_RATE.to_string(),
            report,
        };
    }

    // Duplicate (category, country, chart) rows within one bulletin: the
    // last occurrence wins.
    let mut deduped: HashMap<(VisaCategory, Country, Chart), CategoryEntry> = HashMap::new();
    let mut order: Vec<(VisaCategory, Country, Chart)> = Vec::new();
    for entry in parsed.entries {
        let key = (entry.category, entry.country, entry.chart);
        if deduped.insert(key, entry).is_some() {
            warnings.push(format!(
                "duplicate row for {}/{}/{} collapsed, keeping last occurrence",
                key.0, key.1, key.2
            ));
        } else {
            order.push(key);
        }
    }

    let bulletin_date = parsed.bulletin.bulletin_date;
    let mut entries: Vec<CategoryEntry> = Vec::with_capacity(order.len());
    for key in order {
        let entry = deduped.remove(&key).expect("key collected from map");
        if !entry.is_coherent() {
            errors.push(format!(
                "entry dropped for {}/{}/{}: status {} disagrees with priority date",
                entry.category, entry.country, entry.chart, entry.status
            ));
            continue;
        }
        if let (EntryStatus::Dated, Some(priority_date)) = (entry.status, entry.priority_date) {
            let drift_days = (bulletin_date - priority_date).num_days().abs();
            if drift_days > i64::from(MAX_DRIFT_YEARS) * 366 {
                errors.push(format!(
                    "entry dropped for {}/{}/{}: priority date {} is more than {} years from bulletin date {}",
                    entry.category, entry.country, entry.chart,
                    priority_date, MAX_DRIFT_YEARS, bulletin_date
                ));
                continue;
            }
        }
        entries.push(entry);
    }

    let rows_out = entries.len();
    for message in &warnings {
        warn!(year = parsed.bulletin.year, month = parsed.bulletin.month, "{message}");
    }

    let report = QualityReport {
        rows_in,
        rows_out,
        warnings,
        errors,
        date_parse_rate,
    };

    if entries.is_empty() {
        return NormalizeOutcome::Quarantined {
            bulletin: parsed.bulletin,
            reason: QUARANTINE_NO_ENTRIES.to_string(),
            report,
        };
    }

    NormalizeOutcome::Ready(NormalizedBulletin {
        bulletin: parsed.bulletin,
        entries,
        report,
    })
}

/// Re-check invariants over entries already in the store. Used by the
/// `validate` command; returns human-readable violations.
pub fn check_stored_entries(bulletin: &Bulletin, entries: &[CategoryEntry]) -> Vec<String> {
    let mut violations = Vec::new();
    let mut seen: HashMap<(VisaCategory, Country, Chart), usize> = HashMap::new();

    for entry in entries {
        if !entry.is_coherent() {
            violations.push(format!(
                "{}-{:02}: {}/{}/{} status {} disagrees with priority date",
                bulletin.year, bulletin.month, entry.category, entry.country, entry.chart,
                entry.status
            ));
        }
        *seen.entry((entry.category, entry.country, entry.chart)).or_insert(0) += 1;
    }
    for ((category, country, chart), count) in seen {
        if count > 1 {
            violations.push(format!(
                "{}-{:02}: {count} rows for {category}/{country}/{chart}",
                bulletin.year, bulletin.month
            ));
        }
    }
    if entries.is_empty() {
        violations.push(format!(
            "{}-{:02}: bulletin has no category entries",
            bulletin.year, bulletin.month
        ));
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn parsed_with(entries: Vec<CategoryEntry>, seen: usize, ok: usize) -> ParsedBulletin {
        ParsedBulletin {
            bulletin: Bulletin::new(
                2023,
                3,
                NaiveDate::from_ymd_opt(2023, 3, 1).unwrap(),
                "https://example.gov/b.html".to_string(),
            ),
            entries,
            warnings: Vec::new(),
            date_cells_seen: seen,
            date_cells_parsed: ok,
        }
    }

    fn dated(category: VisaCategory, country: Country, date: NaiveDate) -> CategoryEntry {
        CategoryEntry::new(category, country, Chart::FinalAction, EntryStatus::Dated, Some(date))
    }

    #[test]
    fn low_parse_rate_quarantines() {
        let parsed = parsed_with(
            vec![dated(
                VisaCategory::Eb2,
                Country::China,
                NaiveDate::from_ymd_opt(2023, 1, 15).unwrap(),
            )],
            20,
            3,
        );
        match normalize(parsed, 0.5) {
            NormalizeOutcome::Quarantined { reason, report, .. } => {
                assert_eq!(reason, QUARANTINE_LOW_PARSE_RATE);
                assert!((report.date_parse_rate - 0.15).abs() < 1e-9);
            }
            NormalizeOutcome::Ready(_) => panic!("expected quarantine"),
        }
    }

    #[test]
    fn rate_at_floor_commits() {
        let parsed = parsed_with(
            vec![dated(
                VisaCategory::Eb2,
                Country::China,
                NaiveDate::from_ymd_opt(2023, 1, 15).unwrap(),
            )],
            10,
            5,
        );
        assert!(matches!(normalize(parsed, 0.5), NormalizeOutcome::Ready(_)));
    }

    #[test]
    fn duplicates_collapse_keeping_last() {
        let first = dated(
            VisaCategory::Eb2,
            Country::India,
            NaiveDate::from_ymd_opt(2011, 1, 1).unwrap(),
        );
        let second = dated(
            VisaCategory::Eb2,
            Country::India,
            NaiveDate::from_ymd_opt(2012, 1, 1).unwrap(),
        );
        let parsed = parsed_with(vec![first, second], 2, 2);
        match normalize(parsed, 0.5) {
            NormalizeOutcome::Ready(normalized) => {
                assert_eq!(normalized.entries.len(), 1);
                assert_eq!(
                    normalized.entries[0].priority_date,
                    NaiveDate::from_ymd_opt(2012, 1, 1)
                );
                assert_eq!(normalized.report.rows_in, 2);
                assert_eq!(normalized.report.rows_out, 1);
                assert!(normalized.report.warnings.iter().any(|w| w.contains("duplicate")));
            }
            NormalizeOutcome::Quarantined { .. } => panic!("expected ready"),
        }
    }

    #[test]
    fn implausible_dates_are_dropped() {
        let plausible = dated(
            VisaCategory::F4,
            Country::Philippines,
            NaiveDate::from_ymd_opt(2001, 6, 1).unwrap(),
        );
        let implausible = dated(
            VisaCategory::Eb2,
            Country::India,
            NaiveDate::from_ymd_opt(1905, 1, 1).unwrap(),
        );
        let parsed = parsed_with(vec![plausible, implausible], 2, 2);
        match normalize(parsed, 0.5) {
            NormalizeOutcome::Ready(normalized) => {
                assert_eq!(normalized.entries.len(), 1);
                assert_eq!(normalized.entries[0].category, VisaCategory::F4);
                assert_eq!(normalized.report.errors.len(), 1);
            }
            NormalizeOutcome::Quarantined { .. } => panic!("expected ready"),
        }
    }

    #[test]
    fn empty_bulletin_is_quarantined() {
        let parsed = parsed_with(Vec::new(), 0, 0);
        match normalize(parsed, 0.5) {
            NormalizeOutcome::Quarantined { reason, .. } => {
                assert_eq!(reason, QUARANTINE_NO_ENTRIES);
            }
            NormalizeOutcome::Ready(_) => panic!("expected quarantine"),
        }
    }

    #[test]
    fn stored_entry_checks_catch_violations() {
        let bulletin = Bulletin::new(
            2023,
            3,
            NaiveDate::from_ymd_opt(2023, 3, 1).unwrap(),
            "https://example.gov/b.html".to_string(),
        );
        let mut broken = dated(
            VisaCategory::Eb1,
            Country::Worldwide,
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
        );
        broken.status = EntryStatus::Current;
        let violations = check_stored_entries(&bulletin, &[broken]);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("disagrees"));
    }
}
