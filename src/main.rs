// src/main.rs
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use hazard_grouping_lib::{
    config::{self, AppConfig},
    error::GroupingError,
    grouping::{GroupingAnalyzer, analyze_all_concurrent, groups_from_analyses},
    models::Report,
    services::ErrorHandler,
};

const DEFAULT_REPORTS_FILE: &str = "reports.json";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    info!("Starting hazard report grouping run");
    let start_time = Instant::now();
    let mut phase_times: HashMap<&str, Duration> = HashMap::new();

    // Try to load .env file if it exists
    let env_paths = [".env", ".env.local", "../.env"];
    let mut loaded_env = false;

    for path in env_paths.iter() {
        if Path::new(path).exists() {
            if let Err(e) = config::load_env_from_file(path) {
                warn!("Failed to load environment from {}: {}", path, e);
            } else {
                info!("Loaded environment variables from {}", path);
                loaded_env = true;
                break;
            }
        }
    }

    if !loaded_env {
        info!("No .env file found, using environment variables from system");
    }

    let config_file = std::env::var("GROUPING_CONFIG_FILE").ok().map(PathBuf::from);
    let app_config =
        AppConfig::load(config_file.as_deref()).context("Failed to load grouping configuration")?;

    let errors = ErrorHandler::new(app_config.retry.clone()).with_reporter(Arc::new(|e: &GroupingError| {
        error!("Unhandled grouping failure: {}", e);
    }));

    // Phase 1: load reports
    let phase_start = Instant::now();
    let reports_file =
        std::env::var("GROUPING_REPORTS_FILE").unwrap_or_else(|_| DEFAULT_REPORTS_FILE.to_string());
    let reports = load_reports(Path::new(&reports_file))?;
    phase_times.insert("load_reports", phase_start.elapsed());
    info!(
        "Loaded {} reports from {} in {:.2?}",
        reports.len(),
        reports_file,
        phase_start.elapsed()
    );

    // Phase 2: pairwise analysis
    let phase_start = Instant::now();
    let analyzer = Arc::new(GroupingAnalyzer::new(app_config.grouping.clone())?);
    let reports = Arc::new(reports);
    let analyzed = analyze_all_concurrent(
        Arc::clone(&analyzer),
        Arc::clone(&reports),
        app_config.batch.analysis_workers,
    )
    .await;
    phase_times.insert("analysis", phase_start.elapsed());

    // Phase 3: group detection
    let phase_start = Instant::now();
    let outcome = groups_from_analyses(&reports, analyzed, analyzer.config());
    phase_times.insert("group_detection", phase_start.elapsed());

    for (report_id, e) in &outcome.failures {
        warn!("Report {} left ungrouped after analysis failure", report_id);
        errors.log_error(e);
    }
    for report_id in &outcome.overflow {
        warn!("Report {} matched a group but was left out of it", report_id);
    }

    let output = serde_json::to_string_pretty(&outcome.groups).context("Failed to serialize groups")?;
    println!("{}", output);

    for (phase, elapsed) in &phase_times {
        info!("Phase {} took {:.2?}", phase, elapsed);
    }
    let stats = errors.error_stats();
    if !stats.is_empty() {
        warn!("Errors by category: {:?}", stats);
    }
    info!(
        "Grouping run completed in {:.2?}: {} reports, {} groups, {} failures, {} left out of full groups",
        start_time.elapsed(),
        reports.len(),
        outcome.groups.len(),
        outcome.failures.len(),
        outcome.overflow.len()
    );

    Ok(())
}

fn load_reports(path: &Path) -> Result<Vec<Report>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read reports file {}", path.display()))?;
    let reports: Vec<Report> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse reports file {}", path.display()))?;
    Ok(reports)
}
