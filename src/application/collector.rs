//! Collection orchestration
//!
//! The collector is the single funnel between the fetch workers and the
//! repository, and the only place where run-level outcomes are decided.
//! Each bulletin is handled independently; one bad month never aborts the
//! run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::repositories::BulletinRepository;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::http_client::{FetchError, HttpClient};
use crate::infrastructure::normalizer::{normalize, NormalizeOutcome};
use crate::infrastructure::parsing::BulletinParser;
use crate::infrastructure::url_planner::{plan_current, plan_fiscal_range, PlannedBulletin};

/// Options for a historical backfill.
#[derive(Debug, Clone, Default)]
pub struct CollectOptions {
    /// Re-ingest months that are already stored.
    pub force: bool,
    /// Probe each URL with a HEAD request before downloading.
    pub verify: bool,
    /// Override the configured worker count.
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    NotFound,
    Network,
    Parse,
    Storage,
}

/// One failed bulletin in a run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    pub year: i32,
    pub month: u32,
    pub url: String,
    pub kind: FailureKind,
    pub message: String,
    pub retries: Option<u32>,
}

/// One quarantined bulletin in a run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantinedEntry {
    pub year: i32,
    pub month: u32,
    pub reason: String,
    pub date_parse_rate: f64,
}

/// Summary of one collection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub attempted: usize,
    pub fetched: usize,
    pub parsed: usize,
    pub stored: usize,
    pub skipped: usize,
    pub quarantined: Vec<QuarantinedEntry>,
    pub failed: Vec<FailureEntry>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            attempted: 0,
            fetched: 0,
            parsed: 0,
            stored: 0,
            skipped: 0,
            quarantined: Vec::new(),
            failed: Vec::new(),
            cancelled: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// CLI exit code for this run: 0 clean, 2 partial, 4 storage trouble,
    /// 5 when the network swallowed everything we tried.
    pub fn exit_code(&self) -> i32 {
        if self.failed.iter().any(|f| f.kind == FailureKind::Storage) {
            return 4;
        }
        let network_failures = self
            .failed
            .iter()
            .filter(|f| f.kind == FailureKind::Network)
            .count();
        if network_failures > 0 && self.stored == 0 && network_failures == self.failed.len() {
            return 5;
        }
        if self.cancelled || !self.failed.is_empty() || !self.quarantined.is_empty() {
            return 2;
        }
        0
    }

    /// Plain-text table for terminal output.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        out.push_str("  metric       count\n");
        out.push_str("  -----------  -----\n");
        for (name, value) in [
            ("attempted", self.attempted),
            ("fetched", self.fetched),
            ("parsed", self.parsed),
            ("stored", self.stored),
            ("skipped", self.skipped),
            ("quarantined", self.quarantined.len()),
            ("failed", self.failed.len()),
        ] {
            out.push_str(&format!("  {name:<11}  {value:>5}\n"));
        }
        if self.cancelled {
            out.push_str("  run cancelled before completion\n");
        }
        for entry in &self.quarantined {
            out.push_str(&format!(
                "  quarantined {}-{:02}: {} (date parse rate {:.2})\n",
                entry.year, entry.month, entry.reason, entry.date_parse_rate
            ));
        }
        for failure in &self.failed {
            let retries = failure
                .retries
                .map(|r| format!(" after {r} retries"))
                .unwrap_or_default();
            out.push_str(&format!(
                "  failed {}-{:02} ({:?}{retries}): {}\n",
                failure.year, failure.month, failure.kind, failure.message
            ));
        }
        out
    }
}

struct FetchOutcome {
    planned: PlannedBulletin,
    result: Result<String, FetchError>,
}

/// Orchestrates backfills and the monthly refresh.
pub struct Collector {
    repo: Arc<dyn BulletinRepository>,
    http: Arc<HttpClient>,
    parser: BulletinParser,
    config: AppConfig,
}

impl Collector {
    pub fn new(repo: Arc<dyn BulletinRepository>, http: Arc<HttpClient>, config: AppConfig) -> Self {
        Self {
            repo,
            http,
            parser: BulletinParser::new(),
            config,
        }
    }

    /// Historical backfill over a fiscal-year range.
    pub async fn collect(
        &self,
        fy_from: i32,
        fy_to: i32,
        opts: CollectOptions,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let today = Utc::now().date_naive();
        let planned = plan_fiscal_range(&self.config.source_base_url, fy_from, fy_to, today)?;

        let existing = if opts.force {
            HashSet::new()
        } else {
            self.repo.existing_months(fy_from, fy_to).await?
        };

        let mut report = RunReport::new();
        report.attempted = planned.len();

        let (to_fetch, skipped) = partition_planned(planned, &existing);
        report.skipped = skipped;

        info!(
            fy_from,
            fy_to,
            attempted = report.attempted,
            skipped = report.skipped,
            "🚀 starting historical collection"
        );

        let workers = opts.workers.unwrap_or(self.config.http.max_workers);
        self.run_pipeline(to_fetch, opts.verify, workers, &mut report, &cancel)
            .await;

        report.finished_at = Some(Utc::now());
        info!(
            stored = report.stored,
            failed = report.failed.len(),
            quarantined = report.quarantined.len(),
            "📊 collection finished"
        );
        Ok(report)
    }

    /// Monthly refresh: discover and ingest the current bulletin. Safe to
    /// re-run; the upsert is idempotent.
    pub async fn fetch_current(&self, cancel: CancellationToken) -> Result<RunReport> {
        let mut report = RunReport::new();
        let planned = plan_current(&self.config.source_base_url, &self.http, &cancel).await?;
        report.attempted = 1;

        info!(
            year = planned.year,
            month = planned.month,
            "🚀 refreshing current bulletin"
        );
        self.run_pipeline(
            vec![planned],
            false,
            self.config.http.max_workers,
            &mut report,
            &cancel,
        )
        .await;

        report.finished_at = Some(Utc::now());
        Ok(report)
    }

    /// Fan out fetches under the worker bound, then drain results through
    /// parse, normalize and store. The bounded channel between the two
    /// halves is the backpressure.
    async fn run_pipeline(
        &self,
        to_fetch: Vec<PlannedBulletin>,
        verify: bool,
        workers: usize,
        report: &mut RunReport,
        cancel: &CancellationToken,
    ) {
        let workers = workers.max(1);
        let (tx, mut rx) = mpsc::channel::<FetchOutcome>(2 * workers);
        let semaphore = Arc::new(Semaphore::new(workers));

        for planned in to_fetch {
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            let http = Arc::clone(&self.http);
            let cancel = cancel.clone();
            let budget = Duration::from_secs(self.config.bulletin_budget_seconds);
            let retries = self.config.http.retries;

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                if cancel.is_cancelled() {
                    let _ = tx
                        .send(FetchOutcome {
                            planned,
                            result: Err(FetchError::Cancelled),
                        })
                        .await;
                    return;
                }
                if verify && !http.verify_url(&planned.url).await {
                    let _ = tx
                        .send(FetchOutcome {
                            planned,
                            result: Err(FetchError::NotFound),
                        })
                        .await;
                    return;
                }
                let result =
                    match tokio::time::timeout(budget, http.fetch_with_retries(&planned.url, &cancel))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(FetchError::Exhausted {
                            retries,
                            last_error: "per-bulletin budget exceeded".to_string(),
                        }),
                    };
                let _ = tx.send(FetchOutcome { planned, result }).await;
            });
        }
        drop(tx);

        while let Some(outcome) = rx.recv().await {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match outcome.result {
                Ok(body) => {
                    report.fetched += 1;
                    self.ingest_bulletin(&outcome.planned, &body, report).await;
                }
                Err(FetchError::Cancelled) => {
                    report.cancelled = true;
                }
                Err(FetchError::NotFound) => {
                    info!(
                        year = outcome.planned.year,
                        month = outcome.planned.month,
                        "bulletin does not exist"
                    );
                    report.failed.push(FailureEntry {
                        year: outcome.planned.year,
                        month: outcome.planned.month,
                        url: outcome.planned.url.clone(),
                        kind: FailureKind::NotFound,
                        message: "bulletin not found (404)".to_string(),
                        retries: None,
                    });
                }
                Err(error @ FetchError::Terminal { .. }) => {
                    report.failed.push(FailureEntry {
                        year: outcome.planned.year,
                        month: outcome.planned.month,
                        url: outcome.planned.url.clone(),
                        kind: FailureKind::Network,
                        message: error.to_string(),
                        retries: None,
                    });
                }
                Err(error @ FetchError::Exhausted { .. }) => {
                    let retries = match &error {
                        FetchError::Exhausted { retries, .. } => Some(*retries),
                        _ => None,
                    };
                    warn!(url = %outcome.planned.url, "❌ retries exhausted");
                    report.failed.push(FailureEntry {
                        year: outcome.planned.year,
                        month: outcome.planned.month,
                        url: outcome.planned.url.clone(),
                        kind: FailureKind::Network,
                        message: error.to_string(),
                        retries,
                    });
                }
            }
        }
    }

    async fn ingest_bulletin(&self, planned: &PlannedBulletin, body: &str, report: &mut RunReport) {
        let parsed = match self.parser.parse(body, planned) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(
                    year = planned.year,
                    month = planned.month,
                    error = %error,
                    "❌ bulletin failed to parse"
                );
                report.failed.push(FailureEntry {
                    year: planned.year,
                    month: planned.month,
                    url: planned.url.clone(),
                    kind: FailureKind::Parse,
                    message: error.to_string(),
                    retries: None,
                });
                return;
            }
        };
        report.parsed += 1;

        match normalize(parsed, self.config.date_parse_min_rate) {
            NormalizeOutcome::Quarantined {
                bulletin,
                reason,
                report: quality,
            } => {
                warn!(
                    year = bulletin.year,
                    month = bulletin.month,
                    reason = %reason,
                    rate = quality.date_parse_rate,
                    "⚠️ bulletin quarantined"
                );
                report.quarantined.push(QuarantinedEntry {
                    year: bulletin.year,
                    month: bulletin.month,
                    reason,
                    date_parse_rate: quality.date_parse_rate,
                });
            }
            NormalizeOutcome::Ready(normalized) => {
                match self
                    .repo
                    .upsert_bulletin(&normalized.bulletin, &normalized.entries)
                    .await
                {
                    Ok(_) => {
                        report.stored += 1;
                        info!(
                            year = normalized.bulletin.year,
                            month = normalized.bulletin.month,
                            entries = normalized.entries.len(),
                            "✅ bulletin stored"
                        );
                    }
                    Err(error) => {
                        report.failed.push(FailureEntry {
                            year: normalized.bulletin.year,
                            month: normalized.bulletin.month,
                            url: planned.url.clone(),
                            kind: FailureKind::Storage,
                            message: error.to_string(),
                            retries: None,
                        });
                    }
                }
            }
        }
    }
}

/// Split the plan into months still to fetch and the count of months
/// already stored.
fn partition_planned(
    planned: Vec<PlannedBulletin>,
    existing: &HashSet<(i32, u32)>,
) -> (Vec<PlannedBulletin>, usize) {
    let mut to_fetch = Vec::with_capacity(planned.len());
    let mut skipped = 0usize;
    for candidate in planned {
        if existing.contains(&(candidate.year, candidate.month)) {
            skipped += 1;
        } else {
            to_fetch.push(candidate);
        }
    }
    (to_fetch, skipped)
}
