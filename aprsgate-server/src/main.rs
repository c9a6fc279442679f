use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use aprsgate_server::{
    app,
    config::Config,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            shutdown.cancel();
        }
    });

    app::run(config, shutdown).await?;

    Ok(())
}

#[derive(Debug, Parser)]
pub struct Args {
    /// Path to the JSON configuration file.
    #[clap(long, short, env = "APRSGATE_CONFIG", default_value = "aprsgate.json")]
    config: PathBuf,
}
