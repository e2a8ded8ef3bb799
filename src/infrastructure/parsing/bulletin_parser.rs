//! Bulletin page parser
//!
//! Walks the document in order, keeping track of the nearest preceding
//! chart heading, classifies cutoff tables and turns their rows into
//! category entries. Cell-level problems become warnings; only structural
//! problems (no cutoff tables at all) fail the bulletin.

use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::domain::bulletin::{Bulletin, CategoryEntry, Chart, Country, EntryStatus, VisaCategory};
use crate::domain::constants::MONTH_NAMES;
use crate::infrastructure::url_planner::PlannedBulletin;

use super::dates::{clean_text, parse_cell, CellValue};
use super::error::ParseError;

/// Header keywords that mark a table as carrying cutoff rows.
const CATEGORY_SIGNALS: [&str; 12] = [
    "EMPLOYMENT",
    "FAMILY",
    "EB-",
    "1ST",
    "2ND",
    "3RD",
    "OTHER WORKERS",
    "F1",
    "F2A",
    "F2B",
    "F3",
    "F4",
];

/// Parser output for one bulletin page.
#[derive(Debug, Clone)]
pub struct ParsedBulletin {
    pub bulletin: Bulletin,
    pub entries: Vec<CategoryEntry>,
    pub warnings: Vec<String>,
    /// Cells that should have contained a date literal.
    pub date_cells_seen: usize,
    /// Cells whose date literal parsed.
    pub date_cells_parsed: usize,
}

impl ParsedBulletin {
    /// Success rate over date-candidate cells. A page without any date
    /// cells has nothing to fail at.
    pub fn date_parse_rate(&self) -> f64 {
        if self.date_cells_seen == 0 {
            1.0
        } else {
            self.date_cells_parsed as f64 / self.date_cells_seen as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct BulletinParser;

impl BulletinParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, html: &str, label: &PlannedBulletin) -> Result<ParsedBulletin, ParseError> {
        let document = Html::parse_document(html);

        let bulletin_date = extract_bulletin_date(&document, label);
        let bulletin = Bulletin::new(label.year, label.month, bulletin_date, label.url.clone());

        let walk_selector = Selector::parse("h1, h2, h3, h4, h5, h6, p, u, strong, table")
            .map_err(|e| ParseError::InvalidDocument {
                message: e.to_string(),
            })?;

        let mut chart_context: Option<Chart> = None;
        let mut entries: Vec<CategoryEntry> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut date_cells_seen = 0usize;
        let mut date_cells_parsed = 0usize;
        let mut cutoff_tables = 0usize;

        for element in document.select(&walk_selector) {
            if has_table_ancestor(&element) {
                continue;
            }
            if element.value().name() == "table" {
                let outcome = parse_table(
                    element,
                    chart_context,
                    &mut entries,
                    &mut warnings,
                    &mut date_cells_seen,
                    &mut date_cells_parsed,
                );
                if outcome == TableOutcome::Cutoff {
                    cutoff_tables += 1;
                }
            } else {
                let text = clean_text(&element.text().collect::<String>()).to_ascii_uppercase();
                if text.contains("DATES FOR FILING") {
                    chart_context = Some(Chart::DatesForFiling);
                } else if text.contains("FINAL ACTION") {
                    chart_context = Some(Chart::FinalAction);
                }
            }
        }

        if cutoff_tables == 0 {
            return Err(ParseError::NoVisaTables {
                url: label.url.clone(),
            });
        }

        debug!(
            year = label.year,
            month = label.month,
            entries = entries.len(),
            warnings = warnings.len(),
            "parsed bulletin page"
        );

        Ok(ParsedBulletin {
            bulletin,
            entries,
            warnings,
            date_cells_seen,
            date_cells_parsed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableOutcome {
    Cutoff,
    Ignored,
}

fn parse_table(
    table: ElementRef<'_>,
    chart: Option<Chart>,
    entries: &mut Vec<CategoryEntry>,
    warnings: &mut Vec<String>,
    date_cells_seen: &mut usize,
    date_cells_parsed: &mut usize,
) -> TableOutcome {
    let row_selector = Selector::parse("tr").expect("static selector");
    let cell_selector = Selector::parse("td, th").expect("static selector");

    let rows: Vec<ElementRef<'_>> = table.select(&row_selector).collect();
    if rows.len() < 2 {
        return TableOutcome::Ignored;
    }

    let headers: Vec<String> = rows[0]
        .select(&cell_selector)
        .map(|cell| clean_text(&cell.text().collect::<String>()))
        .collect();
    if !is_cutoff_table(&headers) {
        return TableOutcome::Ignored;
    }

    let Some(chart) = chart else {
        warnings.push(
            "cutoff table skipped: no preceding Final Action / Dates for Filing heading"
                .to_string(),
        );
        return TableOutcome::Ignored;
    };

    let country_columns: Vec<(usize, Country)> = headers
        .iter()
        .enumerate()
        .skip(1)
        .filter_map(|(idx, header)| Country::from_header(header).map(|c| (idx, c)))
        .collect();
    if country_columns.is_empty() {
        warnings.push("cutoff table skipped: no recognizable country columns".to_string());
        return TableOutcome::Ignored;
    }

    for row in &rows[1..] {
        let cells: Vec<ElementRef<'_>> = row.select(&cell_selector).collect();
        if cells.len() < 2 {
            continue;
        }
        let raw_label = clean_text(&cells[0].text().collect::<String>());
        let Some(category) = VisaCategory::from_raw_label(&raw_label) else {
            if !raw_label.is_empty() {
                warnings.push(format!("row dropped: unrecognized category label '{raw_label}'"));
            }
            continue;
        };

        for (column, country) in &country_columns {
            let Some(cell) = cells.get(*column) else {
                continue;
            };
            let raw_cell = cell.text().collect::<String>();
            match parse_cell(&raw_cell) {
                CellValue::Current => entries.push(CategoryEntry::new(
                    category,
                    *country,
                    chart,
                    EntryStatus::Current,
                    None,
                )),
                CellValue::Unavailable => entries.push(CategoryEntry::new(
                    category,
                    *country,
                    chart,
                    EntryStatus::Unavailable,
                    None,
                )),
                CellValue::Date(date) => {
                    *date_cells_seen += 1;
                    *date_cells_parsed += 1;
                    entries.push(CategoryEntry::new(
                        category,
                        *country,
                        chart,
                        EntryStatus::Dated,
                        Some(date),
                    ));
                }
                CellValue::Empty => {}
                CellValue::Unrecognized => {
                    *date_cells_seen += 1;
                    warnings.push(format!(
                        "cell dropped: unparseable cutoff '{}' for {category}/{country}",
                        clean_text(&raw_cell)
                    ));
                }
            }
        }
    }

    TableOutcome::Cutoff
}

/// A cutoff table announces both a category keyword and a country keyword
/// in its header row.
fn is_cutoff_table(headers: &[String]) -> bool {
    let joined = headers.join(" ").to_ascii_uppercase();
    let has_category = CATEGORY_SIGNALS.iter().any(|kw| joined.contains(kw));
    let has_country = headers.iter().any(|h| Country::from_header(h).is_some());
    has_category && has_country
}

fn has_table_ancestor(element: &ElementRef<'_>) -> bool {
    element
        .ancestors()
        .filter_map(|node| node.value().as_element())
        .any(|ancestor| ancestor.name() == "table")
}

/// Publication date from the document text, falling back to the first of
/// the labelled month.
fn extract_bulletin_date(document: &Html, label: &PlannedBulletin) -> NaiveDate {
    let fallback = NaiveDate::from_ymd_opt(label.year, label.month, 1)
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(label.year, 1, 1).expect("valid year"));

    let text = clean_text(&document.root_element().text().collect::<String>());
    let pattern = regex::Regex::new(
        r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+(\d{1,2}),?\s+(\d{4})\b",
    );
    let Ok(pattern) = pattern else {
        return fallback;
    };

    for captures in pattern.captures_iter(&text) {
        let month_name = captures[1].to_ascii_lowercase();
        let Some(month) = MONTH_NAMES.iter().position(|m| *m == month_name) else {
            continue;
        };
        let Ok(day) = captures[2].parse::<u32>() else {
            continue;
        };
        let Ok(year) = captures[3].parse::<i32>() else {
            continue;
        };
        if let Some(date) = NaiveDate::from_ymd_opt(year, month as u32 + 1, day) {
            return date;
        }
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(year: i32, month: u32) -> PlannedBulletin {
        let fiscal_year = crate::domain::bulletin::fiscal_year_for(year, month);
        PlannedBulletin {
            fiscal_year,
            year,
            month,
            url: format!("https://example.gov/{fiscal_year}/visa-bulletin-{year}-{month}.html"),
        }
    }

    const EMPLOYMENT_FINAL_ACTION_HTML: &str = r#"
<html><body>
<p>Visa Bulletin For March 2023</p>
<p><u>A. FINAL ACTION DATES FOR EMPLOYMENT-BASED PREFERENCE CASES</u></p>
<table>
  <tr>
    <td>Employment-based</td>
    <td>All Chargeability Areas Except Those Listed</td>
    <td>CHINA-mainland born</td>
    <td>INDIA</td>
    <td>MEXICO</td>
    <td>PHILIPPINES</td>
  </tr>
  <tr>
    <td>1st</td><td>C</td><td>C</td><td>C</td><td>C</td><td>C</td>
  </tr>
  <tr>
    <td>2nd</td><td>C</td><td>15JAN23</td><td>01JAN12</td><td>C</td><td>C</td>
  </tr>
  <tr>
    <td>Other Workers</td><td>C</td><td>01JUN15</td><td>01JAN12</td><td>C</td><td>C</td>
  </tr>
</table>
</body></html>
"#;

    #[test]
    fn employment_rows_parse_to_canonical_entries() {
        let parser = BulletinParser::new();
        let parsed = parser
            .parse(EMPLOYMENT_FINAL_ACTION_HTML, &label(2023, 3))
            .unwrap();

        let eb2: Vec<&CategoryEntry> = parsed
            .entries
            .iter()
            .filter(|e| e.category == VisaCategory::Eb2)
            .collect();
        assert_eq!(eb2.len(), 5);

        let china = eb2
            .iter()
            .find(|e| e.country == Country::China)
            .expect("china entry");
        assert_eq!(china.status, EntryStatus::Dated);
        assert_eq!(china.priority_date, NaiveDate::from_ymd_opt(2023, 1, 15));
        assert_eq!(china.chart, Chart::FinalAction);

        let worldwide = eb2
            .iter()
            .find(|e| e.country == Country::Worldwide)
            .expect("worldwide entry");
        assert_eq!(worldwide.status, EntryStatus::Current);
        assert_eq!(worldwide.priority_date, None);

        let india = eb2.iter().find(|e| e.country == Country::India).unwrap();
        assert_eq!(india.priority_date, NaiveDate::from_ymd_opt(2012, 1, 1));
    }

    #[test]
    fn other_workers_map_to_their_own_category() {
        let parser = BulletinParser::new();
        let parsed = parser
            .parse(EMPLOYMENT_FINAL_ACTION_HTML, &label(2023, 3))
            .unwrap();

        let other_workers: Vec<&CategoryEntry> = parsed
            .entries
            .iter()
            .filter(|e| e.category == VisaCategory::Eb3OtherWorkers)
            .collect();
        assert_eq!(other_workers.len(), 5);
        let china = other_workers
            .iter()
            .find(|e| e.country == Country::China)
            .unwrap();
        assert_eq!(china.priority_date, NaiveDate::from_ymd_opt(2015, 6, 1));
    }

    #[test]
    fn publication_date_is_extracted_from_text() {
        let html = r#"
<html><body>
<p>This bulletin was published on February 9, 2023.</p>
<p><u>FINAL ACTION DATES FOR FAMILY-SPONSORED PREFERENCE CASES</u></p>
<table>
  <tr><td>Family-Sponsored</td><td>All Chargeability Areas Except Those Listed</td><td>MEXICO</td></tr>
  <tr><td>F1</td><td>01DEC14</td><td>01MAR01</td></tr>
</table>
</body></html>
"#;
        let parsed = BulletinParser::new().parse(html, &label(2023, 3)).unwrap();
        assert_eq!(
            parsed.bulletin.bulletin_date,
            NaiveDate::from_ymd_opt(2023, 2, 9).unwrap()
        );
        assert_eq!(parsed.bulletin.fiscal_year, 2023);
    }

    #[test]
    fn missing_publication_date_falls_back_to_label() {
        let html = r#"
<html><body>
<p><u>FINAL ACTION DATES FOR FAMILY-SPONSORED PREFERENCE CASES</u></p>
<table>
  <tr><td>Family-Sponsored</td><td>Worldwide</td></tr>
  <tr><td>F2A</td><td>C</td></tr>
</table>
</body></html>
"#;
        let parsed = BulletinParser::new().parse(html, &label(2024, 10)).unwrap();
        assert_eq!(
            parsed.bulletin.bulletin_date,
            NaiveDate::from_ymd_opt(2024, 10, 1).unwrap()
        );
        // October bulletins belong to the next fiscal year.
        assert_eq!(parsed.bulletin.fiscal_year, 2025);
    }

    #[test]
    fn filing_chart_heading_switches_context() {
        let html = r#"
<html><body>
<p><u>A. FINAL ACTION DATES FOR EMPLOYMENT-BASED PREFERENCE CASES</u></p>
<table>
  <tr><td>Employment-based</td><td>Worldwide</td><td>INDIA</td></tr>
  <tr><td>3rd</td><td>C</td><td>01MAY12</td></tr>
</table>
<p><u>B. DATES FOR FILING OF EMPLOYMENT-BASED VISA APPLICATIONS</u></p>
<table>
  <tr><td>Employment-based</td><td>Worldwide</td><td>INDIA</td></tr>
  <tr><td>3rd</td><td>C</td><td>01AUG12</td></tr>
</table>
</body></html>
"#;
        let parsed = BulletinParser::new().parse(html, &label(2023, 6)).unwrap();
        let final_action: Vec<_> = parsed
            .entries
            .iter()
            .filter(|e| e.chart == Chart::FinalAction)
            .collect();
        let filing: Vec<_> = parsed
            .entries
            .iter()
            .filter(|e| e.chart == Chart::DatesForFiling)
            .collect();
        assert_eq!(final_action.len(), 2);
        assert_eq!(filing.len(), 2);
        let filing_india = filing.iter().find(|e| e.country == Country::India).unwrap();
        assert_eq!(filing_india.priority_date, NaiveDate::from_ymd_opt(2012, 8, 1));
    }

    #[test]
    fn table_without_heading_is_dropped_with_warning() {
        let html = r#"
<html><body>
<table>
  <tr><td>Employment-based</td><td>Worldwide</td><td>INDIA</td></tr>
  <tr><td>2nd</td><td>C</td><td>01JAN12</td></tr>
</table>
<p><u>FINAL ACTION DATES FOR EMPLOYMENT-BASED PREFERENCE CASES</u></p>
<table>
  <tr><td>Employment-based</td><td>Worldwide</td><td>INDIA</td></tr>
  <tr><td>2nd</td><td>C</td><td>01JAN12</td></tr>
</table>
</body></html>
"#;
        let parsed = BulletinParser::new().parse(html, &label(2023, 6)).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        assert!(parsed
            .warnings
            .iter()
            .any(|w| w.contains("no preceding Final Action")));
    }

    #[test]
    fn unrecognized_rows_and_cells_become_warnings() {
        let html = r#"
<html><body>
<p><u>FINAL ACTION DATES FOR EMPLOYMENT-BASED PREFERENCE CASES</u></p>
<table>
  <tr><td>Employment-based</td><td>Worldwide</td><td>INDIA</td></tr>
  <tr><td>Diversity Visas</td><td>C</td><td>C</td></tr>
  <tr><td>2nd</td><td>see note</td><td>01JAN12</td></tr>
</table>
</body></html>
"#;
        let parsed = BulletinParser::new().parse(html, &label(2023, 6)).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.date_cells_seen, 2);
        assert_eq!(parsed.date_cells_parsed, 1);
        assert!(parsed.warnings.iter().any(|w| w.contains("Diversity Visas")));
        assert!(parsed.warnings.iter().any(|w| w.contains("see note")));
    }

    #[test]
    fn page_without_cutoff_tables_is_a_structural_error() {
        let html = "<html><body><p>Nothing to see here.</p></body></html>";
        let result = BulletinParser::new().parse(html, &label(2023, 6));
        assert!(matches!(result, Err(ParseError::NoVisaTables { .. })));
    }

    #[test]
    fn low_parse_rate_is_reported() {
        let html = r#"
<html><body>
<p><u>FINAL ACTION DATES FOR EMPLOYMENT-BASED PREFERENCE CASES</u></p>
<table>
  <tr><td>Employment-based</td><td>Worldwide</td><td>INDIA</td><td>CHINA-mainland born</td></tr>
  <tr><td>1st</td><td>??</td><td>??</td><td>??</td></tr>
  <tr><td>2nd</td><td>??</td><td>??</td><td>15JAN23</td></tr>
</table>
</body></html>
"#;
        let parsed = BulletinParser::new().parse(html, &label(2023, 6)).unwrap();
        assert_eq!(parsed.date_cells_seen, 6);
        assert_eq!(parsed.date_cells_parsed, 1);
        assert!(parsed.date_parse_rate() < 0.5);
    }
}
