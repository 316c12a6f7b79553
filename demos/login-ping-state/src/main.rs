use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use cmcontrol_client::client::Client;
use cmcontrol_client::config::Config;

use tracing::{info, warn};

#[derive(Parser)]
#[command(
    version,
    about,
    long_about = "Reads the configuration from the environment, e.g. CMC_DEVICE_ADDR, CMC_BROKER_HOST, CMC_API_USER and CMC_API_PASS."
)]
struct Cli {
    /// Prefix of the configuration environment variables.
    #[arg(long, default_value = "CMC_")]
    prefix: String,

    /// `.env` file completing the environment.
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Seconds to wait for the probes of the system. Without this option,
    /// the device stays online until Ctrl-C is pressed.
    #[arg(long)]
    seconds: Option<u64>,

    /// Seconds between two token checks.
    #[arg(long, default_value_t = 30)]
    renewal_check: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let cli = Cli::parse();

    let client = Client::new(config(&cli)?);
    client.connect().await?;

    let token = client.login(None).await?;
    info!("Logged in with a token of {} characters", token.len());

    let deadline = cli.seconds.map(Duration::from_secs);
    let waiting = async {
        let mut checks = tokio::time::interval(Duration::from_secs(cli.renewal_check.max(1)));
        loop {
            let _ = checks.tick().await;
            // Renews the token when it is about to expire.
            if let Err(e) = client.ensure_login(None).await {
                warn!("Unable to renew the token: {e}");
            }
        }
    };

    info!("Waiting for the ping and state probes of the system");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C pressed"),
        () = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending().await,
            }
        } => info!("Done waiting"),
        _ = waiting => {}
    }

    let response = client.logout(None).await?;
    info!("Logout response: {response}");

    client.disconnect().await;

    Ok(())
}

fn config(cli: &Cli) -> cmcontrol_client::error::Result<Config> {
    match &cli.env_file {
        Some(path) => Config::from_env_file(path, &cli.prefix),
        None => Config::from_env(&cli.prefix),
    }
}
