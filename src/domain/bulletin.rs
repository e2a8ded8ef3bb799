//! Bulletin entities and the closed enums they are keyed by.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Visa preference categories tracked by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VisaCategory {
    Eb1,
    Eb2,
    Eb3,
    Eb3OtherWorkers,
    Eb4,
    Eb5,
    F1,
    F2A,
    F2B,
    F3,
    F4,
}

impl VisaCategory {
    pub const ALL: [VisaCategory; 11] = [
        VisaCategory::Eb1,
        VisaCategory::Eb2,
        VisaCategory::Eb3,
        VisaCategory::Eb3OtherWorkers,
        VisaCategory::Eb4,
        VisaCategory::Eb5,
        VisaCategory::F1,
        VisaCategory::F2A,
        VisaCategory::F2B,
        VisaCategory::F3,
        VisaCategory::F4,
    ];

    /// Canonical storage code.
    pub fn as_str(&self) -> &'static str {
        match self {
            VisaCategory::Eb1 => "EB1",
            VisaCategory::Eb2 => "EB2",
            VisaCategory::Eb3 => "EB3",
            VisaCategory::Eb3OtherWorkers => "EB3_OTHER_WORKERS",
            VisaCategory::Eb4 => "EB4",
            VisaCategory::Eb5 => "EB5",
            VisaCategory::F1 => "F1",
            VisaCategory::F2A => "F2A",
            VisaCategory::F2B => "F2B",
            VisaCategory::F3 => "F3",
            VisaCategory::F4 => "F4",
        }
    }

    /// Parse a canonical storage code. Unknown codes are rejected.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "EB1" | "EB-1" => Some(VisaCategory::Eb1),
            "EB2" | "EB-2" => Some(VisaCategory::Eb2),
            "EB3" | "EB-3" => Some(VisaCategory::Eb3),
            "EB3_OTHER_WORKERS" => Some(VisaCategory::Eb3OtherWorkers),
            "EB4" | "EB-4" => Some(VisaCategory::Eb4),
            "EB5" | "EB-5" => Some(VisaCategory::Eb5),
            "F1" => Some(VisaCategory::F1),
            "F2A" => Some(VisaCategory::F2A),
            "F2B" => Some(VisaCategory::F2B),
            "F3" => Some(VisaCategory::F3),
            "F4" => Some(VisaCategory::F4),
            _ => None,
        }
    }

    /// Normalize a raw row label as printed in bulletin tables. Handles the
    /// ordinal forms ("1st", "2nd"), prose headings and the EB-x variants.
    pub fn from_raw_label(label: &str) -> Option<Self> {
        let upper = label.trim().to_ascii_uppercase();
        if upper.is_empty() {
            return None;
        }
        if upper.contains("OTHER WORKERS") {
            return Some(VisaCategory::Eb3OtherWorkers);
        }
        if let Some(cat) = Self::from_code(&upper) {
            return Some(cat);
        }
        // Family rows sometimes carry the code inside longer prose, e.g.
        // "First: (F1) Unmarried Sons and Daughters of U.S. Citizens".
        for (needle, category) in [
            ("F2A", VisaCategory::F2A),
            ("F2B", VisaCategory::F2B),
            ("F1", VisaCategory::F1),
            ("F3", VisaCategory::F3),
            ("F4", VisaCategory::F4),
        ] {
            if upper.contains(needle) {
                return Some(category);
            }
        }
        if upper.starts_with("1ST") || upper.contains("PRIORITY WORKERS") {
            return Some(VisaCategory::Eb1);
        }
        if upper.starts_with("2ND") || upper.contains("ADVANCED DEGREE") {
            return Some(VisaCategory::Eb2);
        }
        if upper.starts_with("3RD") || upper.contains("SKILLED WORKERS") {
            return Some(VisaCategory::Eb3);
        }
        if upper.starts_with("4TH")
            || upper.contains("CERTAIN SPECIAL IMMIGRANTS")
            || upper.contains("CERTAIN RELIGIOUS WORKERS")
        {
            return Some(VisaCategory::Eb4);
        }
        if upper.starts_with("5TH") || upper.contains("EMPLOYMENT 5TH") || upper.contains("INVESTOR")
        {
            return Some(VisaCategory::Eb5);
        }
        None
    }

    pub fn is_employment(&self) -> bool {
        matches!(
            self,
            VisaCategory::Eb1
                | VisaCategory::Eb2
                | VisaCategory::Eb3
                | VisaCategory::Eb3OtherWorkers
                | VisaCategory::Eb4
                | VisaCategory::Eb5
        )
    }

    /// Human-readable preference name used in CLI output.
    pub fn display_name(&self) -> &'static str {
        match self {
            VisaCategory::Eb1 => "Employment-Based First Preference",
            VisaCategory::Eb2 => "Employment-Based Second Preference",
            VisaCategory::Eb3 => "Employment-Based Third Preference",
            VisaCategory::Eb3OtherWorkers => "Employment-Based Third Preference (Other Workers)",
            VisaCategory::Eb4 => "Employment-Based Fourth Preference",
            VisaCategory::Eb5 => "Employment-Based Fifth Preference",
            VisaCategory::F1 => "Unmarried Sons and Daughters of U.S. Citizens",
            VisaCategory::F2A => "Spouses and Unmarried Children of Permanent Residents",
            VisaCategory::F2B => "Unmarried Sons and Daughters of Permanent Residents",
            VisaCategory::F3 => "Married Sons and Daughters of U.S. Citizens",
            VisaCategory::F4 => "Brothers and Sisters of U.S. Citizens",
        }
    }
}

impl fmt::Display for VisaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chargeability countries with their own cutoff columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Country {
    Worldwide,
    China,
    India,
    Mexico,
    Philippines,
}

impl Country {
    pub const ALL: [Country; 5] = [
        Country::Worldwide,
        Country::China,
        Country::India,
        Country::Mexico,
        Country::Philippines,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Country::Worldwide => "WORLDWIDE",
            Country::China => "CHINA",
            Country::India => "INDIA",
            Country::Mexico => "MEXICO",
            Country::Philippines => "PHILIPPINES",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "WORLDWIDE" => Some(Country::Worldwide),
            "CHINA" => Some(Country::China),
            "INDIA" => Some(Country::India),
            "MEXICO" => Some(Country::Mexico),
            "PHILIPPINES" => Some(Country::Philippines),
            _ => None,
        }
    }

    /// Match a table header cell against a country column. Headers vary
    /// across two decades of bulletins ("CHINA-mainland born", "All
    /// Chargeability Areas Except Those Listed").
    pub fn from_header(header: &str) -> Option<Self> {
        let lower = header.trim().to_ascii_lowercase();
        if lower.is_empty() {
            return None;
        }
        if lower.contains("worldwide") || lower.contains("all chargeability") {
            Some(Country::Worldwide)
        } else if lower.contains("china") {
            Some(Country::China)
        } else if lower.contains("india") {
            Some(Country::India)
        } else if lower.contains("mexico") {
            Some(Country::Mexico)
        } else if lower.contains("philippines") {
            Some(Country::Philippines)
        } else {
            None
        }
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the two cutoff charts an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Chart {
    FinalAction,
    DatesForFiling,
}

impl Chart {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chart::FinalAction => "FINAL_ACTION",
            Chart::DatesForFiling => "DATES_FOR_FILING",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "FINAL_ACTION" => Some(Chart::FinalAction),
            "DATES_FOR_FILING" => Some(Chart::DatesForFiling),
            _ => None,
        }
    }
}

impl fmt::Display for Chart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cutoff status of a single table cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    Current,
    Unavailable,
    Dated,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Current => "CURRENT",
            EntryStatus::Unavailable => "UNAVAILABLE",
            EntryStatus::Dated => "DATED",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "CURRENT" => Some(EntryStatus::Current),
            "UNAVAILABLE" => Some(EntryStatus::Unavailable),
            "DATED" => Some(EntryStatus::Dated),
            _ => None,
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One monthly bulletin. `(year, month)` is the identity; `fiscal_year` is
/// always derived from them, never trusted from the source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bulletin {
    pub id: Option<i64>,
    pub fiscal_year: i32,
    pub month: u32,
    pub year: i32,
    pub bulletin_date: NaiveDate,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bulletin {
    pub fn new(year: i32, month: u32, bulletin_date: NaiveDate, source_url: String) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            fiscal_year: fiscal_year_for(year, month),
            month,
            year,
            bulletin_date,
            source_url,
            created_at: now,
            updated_at: now,
        }
    }
}

/// US federal fiscal year: October through September, named for the year it
/// ends in.
pub fn fiscal_year_for(year: i32, month: u32) -> i32 {
    if month >= 10 {
        year + 1
    } else {
        year
    }
}

/// A single cutoff cell, child of a bulletin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryEntry {
    pub id: Option<i64>,
    pub bulletin_id: Option<i64>,
    pub category: VisaCategory,
    pub country: Country,
    pub chart: Chart,
    pub status: EntryStatus,
    pub priority_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

impl CategoryEntry {
    pub fn new(
        category: VisaCategory,
        country: Country,
        chart: Chart,
        status: EntryStatus,
        priority_date: Option<NaiveDate>,
    ) -> Self {
        Self {
            id: None,
            bulletin_id: None,
            category,
            country,
            chart,
            status,
            priority_date,
            notes: None,
        }
    }

    /// Status and priority date must agree: only dated entries carry a date.
    pub fn is_coherent(&self) -> bool {
        match self.status {
            EntryStatus::Dated => self.priority_date.is_some(),
            EntryStatus::Current | EntryStatus::Unavailable => self.priority_date.is_none(),
        }
    }
}

/// One observation of a `(category, country, chart)` series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub bulletin_date: NaiveDate,
    pub status: EntryStatus,
    pub priority_date: Option<NaiveDate>,
}
