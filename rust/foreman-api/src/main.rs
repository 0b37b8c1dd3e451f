//! Foreman API entry point.

use clap::Parser;

use foreman_api::config::AppConfig;
use foreman_api::logging;

#[derive(Debug, Parser)]
#[command(name = "foreman-api", about = "Foreman task dispatch fabric")]
struct Args {
    /// Override the bind port.
    #[arg(long, env = "FOREMAN_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let args = Args::parse();
    let mut config = AppConfig::load()?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "starting foreman-api"
    );
    foreman_api::server::run(config).await
}
