mod args;
mod cache;
mod client;
mod commands;
mod common;
mod constants;
mod error;
mod export;
mod flatten;
mod model;
mod parquet_writer;
mod relations;
mod retry;
mod source;
mod visualize;
mod walker;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("finnkode_fetcher=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    commands::run(args).await
}
