//! Demo binary running a router over the example protocol.
//!
//! Adds every `--port`, relays traffic between them unless told not to, and
//! disposes the router on Ctrl-C.

mod cli;

use std::{error::Error, sync::Arc, time::Duration};

use clap::Parser;
use linkroute::{BroadcastFeature, Connection, Router, protocol::example};
use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    if let Some(addr) = cli.metrics_addr {
        install_metrics_exporter(addr)?;
    }

    let mut builder = Router::builder().id(cli.id).protocols(example::protocols());
    if !cli.no_broadcast {
        builder = builder.feature(BroadcastFeature::new());
    }
    let router = builder.build();
    for uri in &cli.ports {
        router.add_port(uri)?;
    }

    let mut errors = router.on_error();
    let stats_interval = (cli.stats_interval > 0).then(|| Duration::from_secs(cli.stats_interval));
    let stats_router = Arc::clone(&router);
    let reporter = tokio::spawn(async move {
        let Some(period) = stats_interval else {
            return;
        };
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            info!("router statistics: {}", stats_router.statistics().snapshot());
        }
    });
    let error_log = tokio::spawn(async move {
        loop {
            match errors.recv().await {
                Ok(error) => warn!("link error: {error}"),
                Err(RecvError::Lagged(missed)) => warn!("link errors dropped: count={missed}"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    reporter.abort();
    router.dispose_async().await;
    error_log.abort();
    Ok(())
}

#[cfg(feature = "metrics")]
fn install_metrics_exporter(addr: std::net::SocketAddr) -> Result<(), Box<dyn Error>> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!("metrics exporter listening: addr={addr}");
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn install_metrics_exporter(addr: std::net::SocketAddr) -> Result<(), Box<dyn Error>> {
    warn!("metrics exporter unavailable without the `metrics` feature: addr={addr}");
    Ok(())
}
