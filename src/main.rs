use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Datelike, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use visa_tracker::application::analytics::TrendAnalyzer;
use visa_tracker::application::collector::{CollectOptions, Collector};
use visa_tracker::application::forecasting::{Forecaster, ModelKind};
use visa_tracker::domain::bulletin::{Chart, Country, VisaCategory};
use visa_tracker::domain::repositories::BulletinRepository;
use visa_tracker::domain::trend::ForecastKey;
use visa_tracker::infrastructure::config::AppConfig;
use visa_tracker::infrastructure::http_client::HttpClient;
use visa_tracker::infrastructure::logging::init_logging;
use visa_tracker::infrastructure::normalizer::check_stored_entries;
use visa_tracker::infrastructure::repository::make_repository;
use visa_tracker::infrastructure::url_planner::PlannerError;

#[derive(Debug, Parser)]
#[command(name = "visa-tracker", about = "Visa Bulletin collection, analytics and forecasting")]
struct Cli {
    /// Verbose (debug-level) logging.
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Backfill bulletins for a fiscal-year range.
    Collect {
        #[arg(long)]
        start_year: i32,
        #[arg(long)]
        end_year: i32,
        /// Override the configured fetch worker count.
        #[arg(long)]
        workers: Option<usize>,
        /// Re-ingest months that are already stored.
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Probe URLs with a HEAD request before downloading.
        #[arg(long, default_value_t = false)]
        verify: bool,
    },
    /// Fetch and ingest the current bulletin.
    Fetch,
    /// Re-check stored bulletins against the model invariants.
    Validate {
        /// Rewrite bulletins whose entries violate the invariants,
        /// dropping incoherent rows and collapsing duplicates.
        #[arg(long, default_value_t = false)]
        fix: bool,
    },
    /// Trend summary for one category and country.
    Analyze {
        #[arg(long)]
        category: String,
        #[arg(long)]
        country: String,
        /// "final" or "filing".
        #[arg(long, default_value = "final")]
        chart: String,
        /// Trailing window in months, 0 for the whole history.
        #[arg(long, default_value_t = 36)]
        window: u32,
    },
    /// Train a model and forecast the cutoff for a target month.
    Forecast {
        #[arg(long)]
        category: String,
        #[arg(long)]
        country: String,
        #[arg(long, default_value = "final")]
        chart: String,
        /// Defaults to the month after the latest observation.
        #[arg(long)]
        target_year: Option<i32>,
        #[arg(long)]
        target_month: Option<u32>,
        /// "ensemble" or "direction".
        #[arg(long, default_value = "ensemble")]
        model: String,
        /// Also write the trained model artifact here.
        #[arg(long)]
        save_model: Option<PathBuf>,
    },
    /// Store statistics and fiscal-year coverage.
    Stats,
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let cli = Cli::parse();
    let _ = init_logging(cli.verbose);

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!("configuration error: {error:#}");
            return 3;
        }
    };

    let repo = match make_repository(&config.storage).await {
        Ok(repo) => repo,
        Err(error) => {
            error!("storage error: {error:#}");
            return 4;
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("cancellation requested, finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    match dispatch(cli.command, config, repo, cancel).await {
        Ok(code) => code,
        Err(error) => {
            error!("{error:#}");
            match error.downcast_ref::<PlannerError>() {
                Some(PlannerError::UrlTemplate { .. }) => 3,
                Some(PlannerError::IndexFetch { .. }) | Some(PlannerError::NoCurrentBulletin) => 5,
                None => 4,
            }
        }
    }
}

async fn dispatch(
    command: Commands,
    config: AppConfig,
    repo: Arc<dyn BulletinRepository>,
    cancel: CancellationToken,
) -> Result<i32> {
    match command {
        Commands::Collect {
            start_year,
            end_year,
            workers,
            force,
            verify,
        } => {
            let http = Arc::new(HttpClient::new(config.http.clone())?);
            let collector = Collector::new(repo, http, config);
            let report = collector
                .collect(
                    start_year,
                    end_year,
                    CollectOptions {
                        force,
                        verify,
                        workers,
                    },
                    cancel,
                )
                .await?;
            println!("{}", report.render_table());
            Ok(report.exit_code())
        }
        Commands::Fetch => {
            let http = Arc::new(HttpClient::new(config.http.clone())?);
            let collector = Collector::new(repo, http, config);
            let report = collector.fetch_current(cancel).await?;
            println!("{}", report.render_table());
            Ok(report.exit_code())
        }
        Commands::Validate { fix } => validate(repo, fix).await,
        Commands::Analyze {
            category,
            country,
            chart,
            window,
        } => {
            let (category, country, chart) = match parse_series_key(&category, &country, &chart) {
                Ok(key) => key,
                Err(message) => {
                    error!("{message}");
                    return Ok(3);
                }
            };
            let analyzer = TrendAnalyzer::new(repo);
            let summary = analyzer
                .analyze_series(category, country, chart, window)
                .await?;

            println!("{} / {} ({})", category.display_name(), country, chart);
            println!("  observations        {}", summary.observations);
            println!("  window months       {}", summary.window_months);
            if let (Some(start), Some(end)) = (summary.start_date, summary.end_date) {
                println!("  range               {start} .. {end}");
            }
            println!("  total advancement   {} days", summary.total_advancement_days);
            println!("  mean monthly        {:.1} days", summary.mean_monthly_days);
            println!("  volatility          {:.1} days", summary.volatility);
            println!("  direction           {}", summary.trend_direction);
            if let Some(momentum) = summary.momentum {
                println!(
                    "  momentum            {:.1} days/mo (recent {:.1}, earlier {:.1})",
                    momentum.change_days, momentum.recent_mean_days, momentum.earlier_mean_days
                );
            }
            for (index, factor) in summary.seasonal_factors.iter().enumerate() {
                if let Some(factor) = factor {
                    println!("  seasonal factor {:>2}  {:.2}", index + 1, factor);
                }
            }
            Ok(0)
        }
        Commands::Forecast {
            category,
            country,
            chart,
            target_year,
            target_month,
            model,
            save_model,
        } => {
            let (category, country, chart) = match parse_series_key(&category, &country, &chart) {
                Ok(key) => key,
                Err(message) => {
                    error!("{message}");
                    return Ok(3);
                }
            };
            let kind = match model.to_ascii_lowercase().as_str() {
                "ensemble" => ModelKind::Ensemble,
                "direction" => ModelKind::DirectionMagnitude,
                other => {
                    error!("unknown model '{other}', expected 'ensemble' or 'direction'");
                    return Ok(3);
                }
            };

            let today = Utc::now().date_naive();
            let (target_year, target_month) = match (target_year, target_month) {
                (Some(year), Some(month)) if (1..=12).contains(&month) => (year, month),
                (None, None) => next_month(today.year(), today.month()),
                _ => {
                    error!("--target-year and --target-month must be given together, month in 1..=12");
                    return Ok(3);
                }
            };

            let forecaster = Forecaster::new(repo);
            let key = ForecastKey {
                category,
                country,
                chart,
                target_year,
                target_month,
            };
            let (forecast, metrics) = forecaster
                .forecast(key, kind, save_model.as_deref())
                .await?;

            println!(
                "{} / {} ({}) -> {}-{:02}",
                category.display_name(),
                country,
                chart,
                target_year,
                target_month
            );
            match forecast.predicted_date {
                Some(date) => println!("  predicted cutoff    {date}"),
                None => println!("  predicted cutoff    (no observations)"),
            }
            println!("  confidence          {:.2}", forecast.confidence);
            println!("  model               {}", forecast.model_id);
            if let Some(metrics) = metrics {
                println!(
                    "  holdout             mae {:.1}d rmse {:.1}d (split {:.0}%)",
                    metrics.mae_days,
                    metrics.rmse_days,
                    metrics.held_out_split * 100.0
                );
            }
            Ok(0)
        }
        Commands::Stats => stats(repo).await,
    }
}

async fn validate(repo: Arc<dyn BulletinRepository>, fix: bool) -> Result<i32> {
    use std::collections::HashMap;
    use visa_tracker::domain::constants::{FY_CEILING, FY_FLOOR};

    let bulletins = repo.list_bulletins(FY_FLOOR, FY_CEILING).await?;
    let mut violations = Vec::new();
    let mut fixed = 0usize;

    for bulletin in &bulletins {
        let Some(id) = bulletin.id else { continue };
        let entries = repo.get_entries(id).await?;
        let found = check_stored_entries(bulletin, &entries);
        if found.is_empty() {
            continue;
        }
        violations.extend(found);

        if fix {
            // Keep the last coherent row per (category, country, chart).
            let mut deduped = HashMap::new();
            for entry in entries.into_iter().filter(|e| e.is_coherent()) {
                deduped.insert((entry.category, entry.country, entry.chart), entry);
            }
            let repaired: Vec<_> = deduped.into_values().collect();
            if !repaired.is_empty() {
                repo.upsert_bulletin(bulletin, &repaired).await?;
                fixed += 1;
            }
        }
    }

    println!("checked {} bulletins", bulletins.len());
    if violations.is_empty() {
        println!("no invariant violations found");
        Ok(0)
    } else {
        for violation in &violations {
            println!("  {violation}");
        }
        println!("{} violations", violations.len());
        if fix {
            println!("{fixed} bulletins rewritten");
        }
        Ok(2)
    }
}

async fn stats(repo: Arc<dyn BulletinRepository>) -> Result<i32> {
    use std::collections::BTreeMap;
    use visa_tracker::domain::constants::{FY_CEILING, FY_FLOOR};

    let stats = repo.get_stats().await?;
    println!("bulletins           {}", stats.bulletin_count);
    println!("category entries    {}", stats.entry_count);
    if let Some((year, month)) = stats.earliest {
        println!("earliest            {year}-{month:02}");
    }
    if let Some((year, month)) = stats.latest {
        println!("latest              {year}-{month:02}");
    }
    if let Some(last_ingest) = stats.last_ingest_at {
        println!("last ingest         {last_ingest}");
    }

    let bulletins = repo.list_bulletins(FY_FLOOR, FY_CEILING).await?;
    let mut by_fiscal_year: BTreeMap<i32, usize> = BTreeMap::new();
    for bulletin in &bulletins {
        *by_fiscal_year.entry(bulletin.fiscal_year).or_insert(0) += 1;
    }
    if !by_fiscal_year.is_empty() {
        println!("coverage by fiscal year:");
        for (fiscal_year, count) in &by_fiscal_year {
            println!("  FY{fiscal_year}  {count:>2}/12 ({:.0}%)", *count as f64 / 12.0 * 100.0);
        }
    }
    Ok(0)
}

fn parse_series_key(
    category: &str,
    country: &str,
    chart: &str,
) -> std::result::Result<(VisaCategory, Country, Chart), String> {
    let category = VisaCategory::from_code(category)
        .ok_or_else(|| format!("unknown category '{category}'"))?;
    let country =
        Country::from_code(country).ok_or_else(|| format!("unknown country '{country}'"))?;
    let chart = match chart.to_ascii_lowercase().as_str() {
        "final" | "final_action" => Chart::FinalAction,
        "filing" | "dates_for_filing" => Chart::DatesForFiling,
        other => return Err(format!("unknown chart '{other}', expected 'final' or 'filing'")),
    };
    Ok((category, country, chart))
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}
