use anyhow::Context;
use envconfig::Envconfig;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use beacon::config::Config;
use beacon::server::serve;

async fn shutdown(mut term: Signal, mut interrupt: Signal) {
    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Instantiate tracing outputs:
    //   - stdout with a level configured by the RUST_LOG envvar (default=INFO)
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env().context("invalid configuration")?;

    let term = signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let interrupt =
        signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;

    // Open the TCP port and start the server
    let listener = tokio::net::TcpListener::bind(config.address)
        .await
        .context("could not bind port")?;
    serve(config, listener, shutdown(term, interrupt)).await
}
