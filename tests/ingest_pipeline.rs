//! End-to-end checks over parse, normalize and store, without the network.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use tempfile::tempdir;

use visa_tracker::domain::bulletin::{
    fiscal_year_for, CategoryEntry, Chart, Country, EntryStatus, VisaCategory,
};
use visa_tracker::domain::repositories::BulletinRepository;
use visa_tracker::infrastructure::normalizer::{normalize, NormalizeOutcome};
use visa_tracker::infrastructure::parsing::BulletinParser;
use visa_tracker::infrastructure::repository::sqlite::SqliteBulletinRepository;
use visa_tracker::infrastructure::url_planner::PlannedBulletin;

const SAMPLE_BULLETIN_HTML: &str = r#"
<html><body>
<p>Visa Bulletin For March 2023</p>

<p><u>A. FINAL ACTION DATES FOR FAMILY-SPONSORED PREFERENCE CASES</u></p>
<table>
  <tr>
    <td>Family-Sponsored</td>
    <td>All Chargeability&nbsp;Areas Except Those Listed</td>
    <td>CHINA-mainland born</td>
    <td>INDIA</td>
    <td>MEXICO</td>
    <td>PHILIPPINES</td>
  </tr>
  <tr><td>F1</td><td>01DEC14</td><td>01DEC14</td><td>01DEC14</td><td>01MAR01</td><td>01MAR12</td></tr>
  <tr><td>F2A</td><td>C</td><td>C</td><td>C</td><td>C</td><td>C</td></tr>
  <tr><td>F4</td><td>01MAR07</td><td>01MAR07</td><td>15SEP05</td><td>01AUG00</td><td>22AUG02</td></tr>
</table>

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
  <tr><td>1st</td><td>C</td><td>C</td><td>C</td><td>C</td><td>C</td></tr>
  <tr><td>2nd</td><td>C</td><td>15JAN23</td><td>01JAN12</td><td>C</td><td>C</td></tr>
  <tr><td>3rd</td><td>C</td><td>01JUN19</td><td>01MAY12</td><td>C</td><td>C</td></tr>
  <tr><td>Other Workers</td><td>C</td><td>01JUN15</td><td>01JAN12</td><td>C</td><td>C</td></tr>
</table>

<p><u>B. DATES FOR FILING OF EMPLOYMENT-BASED VISA APPLICATIONS</u></p>
<table>
  <tr>
    <td>Employment-based</td>
    <td>All Chargeability Areas Except Those Listed</td>
    <td>CHINA-mainland born</td>
    <td>INDIA</td>
  </tr>
  <tr><td>2nd</td><td>C</td><td>01MAR23</td><td>01JUL12</td></tr>
</table>
</body></html>
"#;

fn label() -> PlannedBulletin {
    PlannedBulletin {
        fiscal_year: fiscal_year_for(2023, 3),
        year: 2023,
        month: 3,
        url: "https://travel.state.gov/visa-bulletin-for-march-2023.html".to_string(),
    }
}

fn entry_key(entry: &CategoryEntry) -> (String, String, String, String, Option<NaiveDate>) {
    (
        entry.category.to_string(),
        entry.country.to_string(),
        entry.chart.to_string(),
        entry.status.to_string(),
        entry.priority_date,
    )
}

#[test]
fn parse_normalize_serialize_round_trip() {
    let parser = BulletinParser::new();
    let parsed = parser.parse(SAMPLE_BULLETIN_HTML, &label()).unwrap();

    let normalized = match normalize(parsed, 0.5) {
        NormalizeOutcome::Ready(normalized) => normalized,
        NormalizeOutcome::Quarantined { reason, .. } => panic!("quarantined: {reason}"),
    };

    // Both charts and all three tables contribute entries.
    assert_eq!(normalized.entries.len(), 3 * 5 + 4 * 5 + 1 * 3);

    // Serialize the canonical form and parse it back; the entry set must
    // survive unchanged.
    let json = serde_json::to_string(&normalized.entries).unwrap();
    let reparsed: Vec<CategoryEntry> = serde_json::from_str(&json).unwrap();

    let before: BTreeSet<_> = normalized.entries.iter().map(entry_key).collect();
    let after: BTreeSet<_> = reparsed.iter().map(entry_key).collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn ingest_twice_changes_nothing_observable() {
    let dir = tempdir().unwrap();
    let dsn = format!("sqlite:{}", dir.path().join("pipeline.db").display());
    let repo = SqliteBulletinRepository::connect(&dsn).await.unwrap();

    let parser = BulletinParser::new();

    let ingest = |html: &'static str| {
        let parsed = parser.parse(html, &label()).unwrap();
        match normalize(parsed, 0.5) {
            NormalizeOutcome::Ready(normalized) => normalized,
            NormalizeOutcome::Quarantined { reason, .. } => panic!("quarantined: {reason}"),
        }
    };

    let first = ingest(SAMPLE_BULLETIN_HTML);
    repo.upsert_bulletin(&first.bulletin, &first.entries)
        .await
        .unwrap();
    let stored_first = repo.get_bulletin(2023, 3).await.unwrap().unwrap();
    let stats_first = repo.get_stats().await.unwrap();

    let second = ingest(SAMPLE_BULLETIN_HTML);
    repo.upsert_bulletin(&second.bulletin, &second.entries)
        .await
        .unwrap();
    let stored_second = repo.get_bulletin(2023, 3).await.unwrap().unwrap();
    let stats_second = repo.get_stats().await.unwrap();

    assert_eq!(stats_first.bulletin_count, stats_second.bulletin_count);
    assert_eq!(stats_first.entry_count, stats_second.entry_count);
    assert_eq!(stored_first.created_at, stored_second.created_at);

    // The stored entry set matches the normalized set.
    let entries = repo
        .get_entries(stored_second.id.unwrap())
        .await
        .unwrap();
    let stored: BTreeSet<_> = entries.iter().map(entry_key).collect();
    let expected: BTreeSet<_> = second.entries.iter().map(entry_key).collect();
    assert_eq!(stored, expected);
}

#[tokio::test]
async fn stored_series_reads_back_in_order() {
    let dir = tempdir().unwrap();
    let dsn = format!("sqlite:{}", dir.path().join("series.db").display());
    let repo = SqliteBulletinRepository::connect(&dsn).await.unwrap();

    let parser = BulletinParser::new();
    let parsed = parser.parse(SAMPLE_BULLETIN_HTML, &label()).unwrap();
    let normalized = match normalize(parsed, 0.5) {
        NormalizeOutcome::Ready(normalized) => normalized,
        NormalizeOutcome::Quarantined { reason, .. } => panic!("quarantined: {reason}"),
    };
    repo.upsert_bulletin(&normalized.bulletin, &normalized.entries)
        .await
        .unwrap();

    let series = repo
        .get_series(
            VisaCategory::Eb2,
            Country::China,
            Chart::FinalAction,
            2023,
            2023,
        )
        .await
        .unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].status, EntryStatus::Dated);
    assert_eq!(series[0].priority_date, NaiveDate::from_ymd_opt(2023, 1, 15));

    let filing = repo
        .get_series(
            VisaCategory::Eb2,
            Country::China,
            Chart::DatesForFiling,
            2023,
            2023,
        )
        .await
        .unwrap();
    assert_eq!(filing.len(), 1);
    assert_eq!(filing[0].priority_date, NaiveDate::from_ymd_opt(2023, 3, 1));
}
