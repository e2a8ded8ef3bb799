//! Cutoff cell and date grammar
//!
//! Bulletins mix the compact `15JAN23` form with longhand and slash dates.
//! Patterns are attempted in a fixed order; failures return `None` rather
//! than cascading errors through the pipeline.

use chrono::NaiveDate;

use crate::domain::constants::{MONTH_ABBREVIATIONS, MONTH_NAMES, TWO_DIGIT_YEAR_PIVOT};

/// Interpretation of one table cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellValue {
    Current,
    Unavailable,
    Date(NaiveDate),
    Empty,
    Unrecognized,
}

/// Strip NBSP and collapse surrounding whitespace.
pub fn clean_text(raw: &str) -> String {
    raw.replace('\u{a0}', " ").trim().to_string()
}

/// Classify a cutoff cell: `C`, `U`, a date literal, or noise.
pub fn parse_cell(raw: &str) -> CellValue {
    let cleaned = clean_text(raw);
    if cleaned.is_empty() {
        return CellValue::Empty;
    }
    match cleaned.to_ascii_uppercase().as_str() {
        "C" | "CURRENT" => return CellValue::Current,
        "U" | "UNAVAILABLE" => return CellValue::Unavailable,
        _ => {}
    }
    match parse_flexible_date(&cleaned) {
        Some(date) => CellValue::Date(date),
        None => CellValue::Unrecognized,
    }
}

/// Attempt all accepted date forms in order.
pub fn parse_flexible_date(raw: &str) -> Option<NaiveDate> {
    let text = clean_text(raw);
    if text.is_empty() {
        return None;
    }
    parse_compact(&text)
        .or_else(|| parse_slashes(&text))
        .or_else(|| parse_month_first(&text))
        .or_else(|| parse_day_first(&text))
}

/// `DDMMMYY`, the canonical State Department form (`15JAN23`).
fn parse_compact(text: &str) -> Option<NaiveDate> {
    let re = regex::Regex::new(r"^(\d{1,2})([A-Za-z]{3})(\d{2})$").ok()?;
    let captures = re.captures(text)?;
    let day: u32 = captures.get(1)?.as_str().parse().ok()?;
    let month = month_from_abbreviation(captures.get(2)?.as_str())?;
    let year = resolve_two_digit_year(captures.get(3)?.as_str().parse().ok()?);
    NaiveDate::from_ymd_opt(year, month, day)
}

/// `MM/DD/YYYY` and `MM/DD/YY`.
fn parse_slashes(text: &str) -> Option<NaiveDate> {
    let re = regex::Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{2,4})$").ok()?;
    let captures = re.captures(text)?;
    let month: u32 = captures.get(1)?.as_str().parse().ok()?;
    let day: u32 = captures.get(2)?.as_str().parse().ok()?;
    let year_text = captures.get(3)?.as_str();
    let year = match year_text.len() {
        2 => resolve_two_digit_year(year_text.parse().ok()?),
        4 => year_text.parse().ok()?,
        _ => return None,
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

/// `MMM DD, YYYY` with abbreviated or full month names.
fn parse_month_first(text: &str) -> Option<NaiveDate> {
    let re = regex::Regex::new(r"^([A-Za-z]{3,9})\.?\s+(\d{1,2}),?\s+(\d{4})$").ok()?;
    let captures = re.captures(text)?;
    let month = month_from_name(captures.get(1)?.as_str())?;
    let day: u32 = captures.get(2)?.as_str().parse().ok()?;
    let year: i32 = captures.get(3)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// `DD MMM YYYY`.
fn parse_day_first(text: &str) -> Option<NaiveDate> {
    let re = regex::Regex::new(r"^(\d{1,2})\s+([A-Za-z]{3,9})\.?\s+(\d{4})$").ok()?;
    let captures = re.captures(text)?;
    let day: u32 = captures.get(1)?.as_str().parse().ok()?;
    let month = month_from_name(captures.get(2)?.as_str())?;
    let year: i32 = captures.get(3)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn month_from_abbreviation(text: &str) -> Option<u32> {
    let upper = text.to_ascii_uppercase();
    MONTH_ABBREVIATIONS
        .iter()
        .position(|abbr| *abbr == upper)
        .map(|idx| idx as u32 + 1)
}

fn month_from_name(text: &str) -> Option<u32> {
    let lower = text.to_ascii_lowercase();
    if lower.len() >= 3 {
        if let Some(idx) = MONTH_NAMES.iter().position(|name| *name == lower) {
            return Some(idx as u32 + 1);
        }
        return month_from_abbreviation(&lower[..3]);
    }
    None
}

/// Two-digit year pivot: 50 and above is the 1900s, below is the 2000s.
fn resolve_two_digit_year(yy: i32) -> i32 {
    if yy >= TWO_DIGIT_YEAR_PIVOT {
        1900 + yy
    } else {
        2000 + yy
    }
}
