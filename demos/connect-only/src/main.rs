use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use cmcontrol_client::client::Client;
use cmcontrol_client::config::Config;

use tracing::info;

#[derive(Parser)]
#[command(
    version,
    about,
    long_about = "Reads the configuration from the environment, e.g. CMC_DEVICE_ADDR and CMC_BROKER_HOST."
)]
struct Cli {
    /// Prefix of the configuration environment variables.
    #[arg(long, default_value = "CMC_")]
    prefix: String,

    /// `.env` file completing the environment.
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Seconds to stay connected.
    #[arg(long, default_value_t = 5)]
    seconds: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    let client = Client::new(config(&cli)?);
    client.connect().await?;

    info!(
        "Device `{}` online for {} s",
        client.config().device_address(),
        cli.seconds
    );
    tokio::time::sleep(Duration::from_secs(cli.seconds)).await;

    client.disconnect().await;

    Ok(())
}

fn config(cli: &Cli) -> cmcontrol_client::error::Result<Config> {
    match &cli.env_file {
        Some(path) => Config::from_env_file(path, &cli.prefix),
        None => Config::from_env(&cli.prefix),
    }
}
