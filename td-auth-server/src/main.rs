use anyhow::Result;

mod backend;
mod config;
mod errors;
mod handlers;
mod logging;
mod records;
mod router;
mod runner;
mod server;
mod state;
mod storage;
mod tls;
mod token;

use runner::Runner;

/// Parses configuration, initialises logging, and runs the credential issuer.
#[tokio::main]
async fn main() -> Result<()> {
    let cfg = config::Config::from_env()?;
    logging::setup_logging(&cfg)?;
    cfg.info();

    let runner = Runner::builder(cfg)
        .bind()
        .await?
        .load_tls()
        .await?
        .build()
        .await?;

    runner.run().await
}
