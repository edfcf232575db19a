use std::time::Duration;

use anyhow::Result;
use switchboard_core::config::{AppConfig, LoadOptions};
use switchboard_server::{bootstrap_with_config, http_router, Collaborators};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use switchboard_core::config::LogFormat::*;

    // RUST_LOG wins over the configured level when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap_with_config(config, Collaborators::default()).await?;
    let shutdown = CancellationToken::new();
    let background = app.start_background(shutdown.clone());

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        bind_address = %address,
        "switchboard gateway listening"
    );

    let router = http_router(&app);
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    wait_for_shutdown().await?;
    tracing::info!(event_name = "system.server.stopping", "switchboard gateway stopping");

    app.shutdown();
    shutdown.cancel();

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    let drained = tokio::time::timeout(grace, async {
        for handle in background {
            let _ = handle.await;
        }
        server.await
    })
    .await;

    match drained {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(error))) => {
            tracing::error!(event_name = "system.server.error", error = %error, "http server failed");
        }
        Ok(Err(error)) => {
            tracing::error!(event_name = "system.server.error", error = %error, "http server task panicked");
        }
        Err(_) => {
            tracing::warn!(
                event_name = "system.server.shutdown_timeout",
                grace_secs = grace.as_secs(),
                "background tasks did not stop within the grace period"
            );
        }
    }

    tracing::info!(event_name = "system.server.stopped", "switchboard gateway stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
