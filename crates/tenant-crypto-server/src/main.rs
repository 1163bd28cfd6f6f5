mod cli;
mod server;
mod sweeper;

use clap::Parser;
use human_panic::setup_panic;

use crate::cli::{StartParams, run_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_panic!();
    shared::env::configure_env()?;
    shared::logging::configure_logging()?;

    let params = StartParams::parse();

    run_server(params).await
}
