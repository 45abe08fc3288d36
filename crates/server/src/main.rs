//! klens server binary: resolve cluster credentials, bootstrap the informer
//! fleet, and serve the browsing API.

#![forbid(unsafe_code)]

mod config;
mod http;

use std::net::SocketAddr;
use std::str::FromStr;

use clap::Parser;
use klens_api::Browser;
use klens_fleet::StrategyConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let env = std::env::var("KLENS_LOG").unwrap_or_else(|_| default.to_string());
    let filter = EnvFilter::from_str(&env).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KLENS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KLENS_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = config::Args::parse();
    init_tracing(args.debug);
    init_metrics();
    info!("starting klens");

    let client = config::build_client(args.kubeconfig.as_deref()).await?;
    let browser = Browser::new(client, StrategyConfig::default());
    browser.bootstrap().await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(http::router(browser.clone()).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped; shutting down the fleet");
    browser.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
