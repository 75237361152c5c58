use std::time::Duration;

use clap::Parser;
use fleet_relay::reassembly::DEFAULT_MAX_CHUNKS;
use fleet_relay::registry::RelayConfig;
use fleet_relay::{run_server, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fleet-relay")]
#[command(about = "Relay commands to connected agents and return their results", version)]
struct Cli {
    #[arg(long, env = "FLEET_RELAY_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 3001)]
    port: u16,

    /// Shared secret agents must present when registering.
    #[arg(long, env = "AGENT_SECRET", hide_env_values = true)]
    agent_secret: String,

    /// Required in the `x-api-key` header of operator requests when set.
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, default_value_t = 30_000)]
    default_timeout_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    keep_alive_extension_ms: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_CHUNKS)]
    max_chunks: usize,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        tracing::error!(error = %err, "fleet-relay failed");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let relay = RelayConfig {
        default_timeout: Duration::from_millis(cli.default_timeout_ms),
        keep_alive_extension: Duration::from_millis(cli.keep_alive_extension_ms),
        max_chunks: cli.max_chunks,
        ..RelayConfig::new(cli.agent_secret)
    };
    run_server(ServerConfig {
        host: cli.host,
        port: cli.port,
        relay,
        api_key: cli.api_key.filter(|key| !key.is_empty()),
        cors_allow_origin: cli.cors_allow_origin,
    })
    .await?;
    Ok(())
}
