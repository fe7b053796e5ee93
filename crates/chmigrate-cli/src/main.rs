//! chmigrate binary.

use chmigrate_cli::{logging, run, Args};
use chmigrate_client::HttpClickHouse;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let started = chrono::Local::now();

    // Parse command line args
    let config = Args::parse().into_config()?;

    let log_file = logging::init(&config.log, started)?;
    std::fs::create_dir_all(&config.report_path)?;

    info!(
        mode = %config.mode,
        database = %config.database,
        table = config.table.as_deref().unwrap_or("all"),
        host = %config.client.host,
        port = config.client.port,
        user = %config.client.user,
        s3_policy = %config.migration.storage_policy,
        resume = config.migration.resume,
        log_file = %log_file.display(),
        "Starting ClickHouse storage policy migration"
    );

    let client = Arc::new(HttpClickHouse::new(config.client.clone())?);

    let report = match run::execute(client, &config, started).await {
        Ok(report) => report,
        Err(err) => {
            error!(error = %format!("{err:#}"), "Migration run aborted");
            return Ok(ExitCode::FAILURE);
        }
    };

    match report.write(&config.report_path) {
        Ok(path) => info!(path = %path.display(), "Report written"),
        Err(err) => error!(error = %err, "Failed to write report"),
    }
    report.log_summary();

    if report.summary.has_failures() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
