use std::process::ExitCode;

use anyhow::{Context, Result};
use beach_pager::config::{Cli, PagerConfig};
use beach_pager::orchestrator;
use beach_pager::telemetry::logging;
use clap::Parser;

#[tokio::main]
async fn main() -> ExitCode {
    match try_main().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("beach-pager: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let config = PagerConfig::try_from(cli)?;
    logging::init(&config.log).context("failed to initialise logging")?;

    orchestrator::run(config).await?;
    Ok(())
}
