//! Candidate URL planning for bulletin pages
//!
//! The State Department publishes one page per month under a fiscal-year
//! path segment, with the month spelled out in English. Planning is
//! deterministic from its inputs; only "current" mode touches the network.

use chrono::NaiveDate;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::bulletin::fiscal_year_for;
use crate::domain::constants::MONTH_NAMES;

use super::http_client::HttpClient;

/// Years outside this range are treated as caller mistakes rather than
/// candidate bulletins.
const MIN_FISCAL_YEAR: i32 = 1998;
const MAX_FISCAL_YEAR: i32 = 2100;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("malformed fiscal year range [{fy_from}, {fy_to}]")]
    UrlTemplate { fy_from: i32, fy_to: i32 },

    #[error("failed to fetch bulletin index page: {reason}")]
    IndexFetch { reason: String },

    #[error("no bulletin link found on the index page")]
    NoCurrentBulletin,
}

/// One candidate bulletin URL with its identity label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBulletin {
    pub fiscal_year: i32,
    pub year: i32,
    pub month: u32,
    pub url: String,
}

/// Canonical URL for one bulletin month.
pub fn bulletin_url(base_url: &str, fiscal_year: i32, year: i32, month: u32) -> String {
    let month_name = MONTH_NAMES[(month - 1) as usize];
    format!(
        "{}/{}/visa-bulletin-for-{}-{}.html",
        base_url.trim_end_matches('/'),
        fiscal_year,
        month_name,
        year
    )
}

/// Enumerate candidate URLs for a fiscal-year range, October first. Months
/// after `today` are not planned; those bulletins do not exist yet.
pub fn plan_fiscal_range(
    base_url: &str,
    fy_from: i32,
    fy_to: i32,
    today: NaiveDate,
) -> Result<Vec<PlannedBulletin>, PlannerError> {
    if fy_from > fy_to || fy_from < MIN_FISCAL_YEAR || fy_to > MAX_FISCAL_YEAR {
        return Err(PlannerError::UrlTemplate { fy_from, fy_to });
    }

    use chrono::Datelike;
    let mut planned = Vec::new();
    for fiscal_year in fy_from..=fy_to {
        // FY N runs October of N-1 through September of N.
        let months = (10..=12)
            .map(|m| (fiscal_year - 1, m))
            .chain((1..=9).map(|m| (fiscal_year, m)));
        for (year, month) in months {
            if year > today.year() || (year == today.year() && month > today.month()) {
                continue;
            }
            debug_assert_eq!(fiscal_year_for(year, month), fiscal_year);
            planned.push(PlannedBulletin {
                fiscal_year,
                year,
                month,
                url: bulletin_url(base_url, fiscal_year, year, month),
            });
        }
    }
    Ok(planned)
}

/// Discover the topmost published bulletin from the index page.
pub async fn plan_current(
    base_url: &str,
    http: &HttpClient,
    cancel: &CancellationToken,
) -> Result<PlannedBulletin, PlannerError> {
    let index_url = format!("{}.html", base_url.trim_end_matches('/'));
    let body = http
        .fetch_with_retries(&index_url, cancel)
        .await
        .map_err(|e| PlannerError::IndexFetch {
            reason: e.to_string(),
        })?;

    extract_current_link(&body, base_url).ok_or(PlannerError::NoCurrentBulletin)
}

/// Pull the first (topmost) bulletin link out of index page HTML.
fn extract_current_link(html: &str, base_url: &str) -> Option<PlannedBulletin> {
    let document = Html::parse_document(html);
    let link_selector = Selector::parse("a[href]").ok()?;
    let href_pattern = regex::Regex::new(r"visa-bulletin-for-([a-z]+)-(\d{4})\.html").ok()?;

    for link in document.select(&link_selector) {
        let href = match link.value().attr("href") {
            Some(href) => href.to_ascii_lowercase(),
            None => continue,
        };
        let Some(captures) = href_pattern.captures(&href) else {
            continue;
        };
        let month_name = captures.get(1)?.as_str();
        let year: i32 = captures.get(2)?.as_str().parse().ok()?;
        let month = MONTH_NAMES.iter().position(|m| *m == month_name)? as u32 + 1;
        let fiscal_year = fiscal_year_for(year, month);
        debug!(month_name, year, "discovered current bulletin link");
        return Some(PlannedBulletin {
            fiscal_year,
            year,
            month,
            url: bulletin_url(base_url, fiscal_year, year, month),
        });
    }
    None
}
