mod admin;
mod config;
mod frontend;
mod registry;
mod server;
mod sql;


use clap::Parser;
use config::Config;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Parser)]
#[command(name = "relaygate", about = "Primary-aware PostgreSQL proxy")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "relaygate.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let config = Config::from_path(&args.config)?;
    server::run(config).await?;
    Ok(())
}
