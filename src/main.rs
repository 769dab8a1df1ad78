#[macro_use]
extern crate tracing;

#[macro_use]
mod display;

mod app;
mod config;
mod control;
mod forward;
mod mapping;
mod proxy;
mod signal;
mod store;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use eyre::{Context, Result};
use tracing_subscriber::EnvFilter;

use self::app::App;
use self::config::Config;

/// Forward TCP ports and proxy HTTP requests by port.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "portrelay.conf")]
    config: PathBuf,

    /// Check the configuration and the mappings, then exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(filter)
        .init();

    match try_main().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main() -> Result<()> {
    let args = Args::parse();
    let path = &args.config;

    let config = Config::read(path)
        .await
        .with_context(|| format!("{}", path.display()))?;

    let app = App::try_from(config)?;

    if args.check {
        return app.check().await;
    }

    app.run().await
}
