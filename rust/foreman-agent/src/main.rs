//! Foreman worker agent entry point.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch};

use foreman_agent::client::AgentClient;
use foreman_agent::config::AgentConfig;
use foreman_agent::executor::ProcessEngine;
use foreman_agent::monitor::ResourceMonitor;
use foreman_agent::processor::TaskProcessor;

#[derive(Debug, Parser)]
#[command(name = "foreman-agent", about = "Foreman worker agent")]
struct Args {
    /// Override the gateway URL.
    #[arg(long, env = "FOREMAN_GATEWAY_URL")]
    gateway_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let mut config = AgentConfig::load()?;
    if let Some(url) = args.gateway_url {
        config.gateway_url = url;
    }
    let config = Arc::new(config);

    let engine_command = config
        .engine_command
        .clone()
        .ok_or_else(|| anyhow::anyhow!("engine_command must be configured"))?;
    let engine = Arc::new(ProcessEngine::new(engine_command));

    let monitor = Arc::new(ResourceMonitor::new(config.resources.clone()));
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let processor = TaskProcessor::new(
        engine,
        monitor.clone(),
        outbound_tx,
        config.max_concurrent,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor_handle = monitor.spawn(processor.clone(), shutdown_tx.clone());

    // Ctrl-C initiates the same graceful path as resource danger.
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("interrupt received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(
        agent_id = %config.agent_id,
        version = env!("CARGO_PKG_VERSION"),
        max_concurrent = config.max_concurrent,
        "starting foreman-agent"
    );

    let client = AgentClient::new(
        config,
        processor,
        monitor,
        outbound_rx,
        shutdown_rx,
    );
    let result = client.run().await;
    monitor_handle.abort();
    result?;
    Ok(())
}
