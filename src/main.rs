mod config;
mod exporter;
mod network;
#[cfg(test)]
mod test_support;

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{runtime::Builder, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Args, MonitorConfig};
use crate::exporter::http_server::MetricsServer;
use crate::exporter::{spawn_monitor, Instruments, Monitor};
use crate::network::OriginResolver;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn main() {
    // parse command line arguments
    let args = Args::parse();
    init_logging();

    // one probe task plus the scrape handlers
    let rt = match Builder::new_multi_thread().worker_threads(2).enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            error!(error = %err, "failed to start tokio runtime");
            std::process::exit(1);
        }
    };

    // if error log it and exit
    if let Err(err) = rt.block_on(run(args)) {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = MonitorConfig::from_args(args, |key| std::env::var(key).ok())?;
    info!(
        url = %config.url,
        interval = ?config.interval,
        scrape_port = config.scrape_port,
        namespace = %config.namespace,
        subsystem = %config.subsystem,
        metric_name = %config.metric_name,
        "httpwatch starting"
    );

    let origin = match config.origin.clone() {
        Some(origin) => origin,
        None => OriginResolver::new(config.metadata_url.clone()).resolve().await?,
    };

    // All instruments are registered before anything reads or writes them.
    let registry = Arc::new(Registry::new());
    let instruments = Arc::new(Instruments::register(&registry, &config.identity(origin))?);

    let server = MetricsServer::bind(SocketAddr::from(([0, 0, 0, 0], config.scrape_port))).await?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let monitor = Monitor::new(client, config.url.clone(), config.interval, instruments)
        .with_probe_timeout(config.probe_timeout);
    let probe_task = spawn_monitor(monitor, shutdown.clone());

    server.serve(registry, shutdown.clone()).await;

    probe_task.await.context("probe loop panicked")?;
    info!("httpwatch stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("received shutdown signal, shutting down gracefully");
        shutdown.cancel();
    });
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
