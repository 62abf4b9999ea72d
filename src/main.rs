#![deny(clippy::expect_used)]
#![deny(clippy::unwrap_used)]

mod assemble;
mod cli;
mod common;
mod compose;
mod config;
mod dataplane;
mod discoverer;
mod error;
mod http;
mod reconciler;
mod registry;
mod service;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use std::process::ExitCode;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(cli.init_logging())
        .with(tracing_subscriber::fmt::layer().with_target(false).with_level(true).compact())
        .try_init()
        .context("error initializing logging")?;

    tracing::info!("starting {} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    Ok(match cli.run().await {
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
        Ok(()) => ExitCode::SUCCESS,
    })
}
