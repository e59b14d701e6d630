#![forbid(unsafe_code)]

//! Wires configuration, logging, the SQL executor and the Orchestrator
//! together, then loops forever: run once, sleep, repeat.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use catalog_etl::config::{Settings, DEFAULT_ENV_PATH};
use catalog_etl::index_loader::IndexLoader;
use catalog_etl::logging;
use catalog_etl::orchestrator::Orchestrator;
use catalog_etl::sql::SqlExecutor;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(about = "Incremental catalog -> search index ETL")]
struct Cli {
    /// Path to the `.env` file to load settings from.
    #[arg(long, env = "ETL_ENV_FILE", default_value = DEFAULT_ENV_PATH)]
    env_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.env_file).context("loading configuration")?;
    let _logging_guard = logging::init(std::path::Path::new(&settings.log.etl))?;

    tracing::info!("catalog_etl starting up");

    let sql = SqlExecutor::connect(&settings.db)
        .await
        .context("connecting to relational catalog")?;
    let index = IndexLoader::new(&settings.index).context("constructing index loader")?;
    let orchestrator = Orchestrator::new(&sql, &index, &settings);

    let mut first_run = true;
    loop {
        match orchestrator.run_once().await {
            Ok(()) => {}
            Err(err) if err.is_interlock() => {
                tracing::warn!("a previous run never finished, refusing to start");
                if first_run {
                    return Ok(ExitCode::FAILURE);
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "run failed, will retry after the sleep period");
            }
        }
        first_run = false;
        tokio::time::sleep(std::time::Duration::from_secs(settings.main.sleep_period_secs)).await;
    }
}
