use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use cmcontrol_client::apontamento::BatchOptions;
use cmcontrol_client::client::Client;
use cmcontrol_client::config::Config;

use tracing::{error, info};

#[derive(Parser)]
#[command(
    version,
    about,
    long_about = "Reads the configuration from the environment, e.g. CMC_DEVICE_ADDR, CMC_BROKER_HOST, CMC_API_USER and CMC_API_PASS."
)]
struct Cli {
    /// Serials to point, one request each.
    #[arg(required = true)]
    serials: Vec<String>,

    /// Milliseconds to wait between two submissions.
    #[arg(long, default_value_t = 200)]
    delay: u64,

    /// Stops at the first failed serial.
    #[arg(long)]
    stop_on_error: bool,

    /// Seconds to wait for each response.
    #[arg(long, default_value_t = 15)]
    timeout: u64,

    /// Prefix of the configuration environment variables.
    #[arg(long, default_value = "CMC_")]
    prefix: String,

    /// `.env` file completing the environment.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    let client = Client::new(config(&cli)?);
    client.connect().await?;
    client.ensure_login(None).await?;

    let options = BatchOptions::new()
        .timeout(Duration::from_secs(cli.timeout))
        .delay(Duration::from_millis(cli.delay))
        .stop_on_error(cli.stop_on_error);

    let items = client.apontar_lote(&cli.serials, options).await;
    for item in &items {
        match &item.result {
            Ok(response) => info!("OK  {}: {response}", item.serial),
            Err(e) => error!("NOK {}: {e}", item.serial),
        }
    }

    let failed = items.iter().filter(|item| item.result.is_err()).count();
    if items.len() < cli.serials.len() {
        info!(
            "{} serials skipped after the first failure",
            cli.serials.len() - items.len()
        );
    }

    if let Err(e) = client.logout(None).await {
        error!("Logout failed: {e}");
    }
    client.disconnect().await;

    if failed > 0 {
        return Err(format!("{failed} serials not pointed").into());
    }

    Ok(())
}

fn config(cli: &Cli) -> cmcontrol_client::error::Result<Config> {
    match &cli.env_file {
        Some(path) => Config::from_env_file(path, &cli.prefix),
        None => Config::from_env(&cli.prefix),
    }
}
