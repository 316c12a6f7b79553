use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use cmcontrol::document::{ADICIONAR_TRANSPORTE, Apontamento, Setup, TransportOrder};

use cmcontrol_client::apontamento::{evidence_from_file, serial_code};
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
    /// Serial to point.
    serial: String,

    /// Serials linked to the first one in the same apontamento.
    #[arg(long = "linked")]
    linked: Vec<String>,

    /// Files attached as evidences.
    #[arg(long = "evidence")]
    evidences: Vec<PathBuf>,

    /// Validates the route of the serial instead of pointing it.
    #[arg(long, conflicts_with_all = ["linked", "evidences", "transport_order"])]
    validate: bool,

    /// Code of the transport order the serial belongs to.
    #[arg(long)]
    transport_order: Option<String>,

    /// Adds the serial to the transport order instead of pointing the
    /// transport itself.
    #[arg(long, requires = "transport_order")]
    add: bool,

    /// Prints the submitted document without connecting.
    #[arg(long)]
    dry_run: bool,

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
    let config = config(&cli)?;
    let timeout = Some(Duration::from_secs(cli.timeout));

    let evidences = cli
        .evidences
        .iter()
        .map(evidence_from_file)
        .collect::<Result<Vec<_>, _>>()?;
    let seriais = std::iter::once(&cli.serial)
        .chain(&cli.linked)
        .map(|serial| serial_code(serial))
        .collect::<Result<Vec<_>, _>>()?;
    let apontamento = Apontamento::linked(seriais).evidences(evidences);

    let transport_order = cli.transport_order.as_deref().map(|code| {
        let order = TransportOrder::new(code);
        if cli.add {
            order.acao(ADICIONAR_TRANSPORTE)
        } else {
            order
        }
    });

    if cli.dry_run {
        let mut setup = Setup::new(config.device_address()).apontamento(apontamento);
        if let Some(order) = transport_order {
            setup = setup.ordem_transporte(order);
        }
        println!("{}", serde_json::to_string_pretty(&setup)?);
        return Ok(());
    }

    let client = Client::new(config);
    client.connect().await?;

    let response = if cli.validate {
        client.validar_rota(&cli.serial, timeout).await
    } else if let Some(order) = transport_order {
        client.ordem_transporte(order, [apontamento], timeout).await
    } else {
        let setup = Setup::new(client.config().device_address()).apontamento(apontamento);
        client.setup_apontamento(&setup, timeout).await
    };

    match &response {
        Ok(response) => info!("Response: {response}"),
        Err(e) => {
            error!("{e}");
            if let Some(exchange) = client.last_exchange() {
                error!("Request: {}", exchange.request);
                error!("Response: {:?}", exchange.response);
            }
        }
    }

    if let Err(e) = client.logout(timeout).await {
        error!("Logout failed: {e}");
    }
    client.disconnect().await;

    response.map(|_| ()).map_err(Into::into)
}

fn config(cli: &Cli) -> cmcontrol_client::error::Result<Config> {
    match &cli.env_file {
        Some(path) => Config::from_env_file(path, &cli.prefix),
        None => Config::from_env(&cli.prefix),
    }
}
