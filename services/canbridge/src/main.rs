//! canbridge: two-interface CAN bridge with blocklist and lift control

use std::io::IsTerminal;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use canbridge::cli::{run_batch, Args};
use canbridge::runtime::run_service;
use common::{init_with_config, LogConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config().context("Failed to load configuration")?;

    if args.print_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }
    if args.validate {
        println!("Configuration is valid");
        return Ok(());
    }

    let _log_guard = init_with_config(LogConfig {
        service_name: "canbridge".to_string(),
        level: config.logging.level.clone(),
        log_dir: config.logging.dir.clone(),
        enable_json: config.logging.json,
        ansi: std::io::stderr().is_terminal(),
    })
    .context("Failed to initialize logging")?;

    let batch = args.batch_commands();
    if !batch.is_empty() {
        let replies = run_batch(config.control.listen, &batch).await?;
        for reply in replies {
            println!("{reply}");
        }
        return Ok(());
    }

    info!(
        "Starting canbridge {} ({} <-> {})",
        env!("CARGO_PKG_VERSION"),
        config.interfaces.side_a,
        config.interfaces.side_b
    );

    if let Err(e) = run_service(config).await {
        error!("canbridge stopped with error: {}", e);
        return Err(e.into());
    }
    info!("canbridge stopped");
    Ok(())
}
