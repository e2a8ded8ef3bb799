//! Domain constants shared across the pipeline.

use super::bulletin::{Country, VisaCategory};

/// Two-digit years at or above this pivot are read as 19xx, below as 20xx.
pub const TWO_DIGIT_YEAR_PIVOT: i32 = 50;

/// Priority dates further than this many years from the bulletin date are
/// treated as parse errors and rejected by the normalizer.
pub const MAX_DRIFT_YEARS: i32 = 30;

/// Minimum number of dated observations required before a trained model is
/// consulted for a forecast.
pub const MIN_OBS: usize = 12;

/// Hard bound on a single forecast step, in days.
pub const MAX_FORECAST_DELTA_DAYS: i64 = 365;

/// Default floor for the per-bulletin date parse success rate.
pub const DEFAULT_DATE_PARSE_MIN_RATE: f64 = 0.5;

/// Widest fiscal-year span derived readers ever ask the store for.
pub const FY_FLOOR: i32 = 1998;
pub const FY_CEILING: i32 = 2100;

/// Default root for State Department bulletin pages.
pub const DEFAULT_SOURCE_BASE_URL: &str =
    "https://travel.state.gov/content/travel/en/legal/visa-law0/visa-bulletin";

/// Per-country demand scalars. Documented constants of the domain model, not
/// hyperparameters. Training must never overwrite them.
pub fn country_factor(country: Country) -> f64 {
    match country {
        Country::India => 0.3,
        Country::China => 0.5,
        Country::Mexico => 0.7,
        Country::Philippines => 0.7,
        Country::Worldwide => 1.0,
    }
}

/// Per-category demand scalars, same contract as [`country_factor`].
pub fn category_factor(category: VisaCategory) -> f64 {
    match category {
        VisaCategory::Eb1 => 0.9,
        VisaCategory::Eb2 => 0.6,
        VisaCategory::Eb3 => 0.5,
        VisaCategory::Eb3OtherWorkers => 0.4,
        VisaCategory::Eb4 => 0.8,
        VisaCategory::Eb5 => 0.7,
        VisaCategory::F1 => 0.5,
        VisaCategory::F2A => 0.9,
        VisaCategory::F2B => 0.5,
        VisaCategory::F3 => 0.4,
        VisaCategory::F4 => 0.3,
    }
}

pub const MONTH_NAMES: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

pub const MONTH_ABBREVIATIONS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
