use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

/// Hibernates idle Minecraft servers and wakes them on demand.
#[derive(Parser)]
#[command(name = "craftynap")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short = 'c', default_value = "craftynap.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    craftynap::run(&cli.config).await
}
