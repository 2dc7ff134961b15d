//! # Mediasort Daemon Binary
//!
//! Entry point for the mediasort daemon: a media-file metadata pipeline
//! that fans work out to sandboxed container-plugin workers.
//!
//! ## Usage
//!
//! ```bash
//! # Default configuration file
//! mediasort-daemon
//!
//! # Custom configuration and binding
//! mediasort-daemon --config mediasort.toml --host 0.0.0.0 --port 8080
//!
//! # Debug logging
//! mediasort-daemon --log-level debug
//! ```
//!
//! ## Shutdown
//!
//! On Ctrl+C the daemon closes the admission gate, waits for in-flight
//! tasks to drain (bounded), then stops every owned worker.

use clap::Parser;
use mediasort_daemon::config::Config;
use mediasort_daemon::server::{create_server, Collaborators};
use std::net::SocketAddr;
use std::time::Duration;

/// Command line arguments for the mediasort daemon.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "mediasort.toml")]
    config: String,

    /// Port number for the HTTP server. Overrides the configuration.
    #[arg(short, long)]
    port: Option<u16>,

    /// Host address to bind the server to. Overrides the configuration.
    #[arg(long)]
    host: Option<String>,

    /// Logging level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::load(&args.config)?
    } else {
        tracing::warn!(path = %args.config, "configuration file not found, using defaults");
        Config::default()
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    config.validate()?;

    let collaborators = Collaborators::from_config(&config);
    let (app, state) = create_server(config.clone(), collaborators).await?;

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!(%addr, "starting mediasort daemon");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Drain: stop admitting tasks, let in-flight ones settle, then stop
    // the workers.
    state.gate.set_open(false);
    if let Some(scheduler) = &state.scheduler {
        let drained = scheduler.wait_for_empty(Duration::from_secs(120)).await;
        if !drained {
            tracing::warn!("drain timed out with tasks still in flight");
        }
    }
    state.batcher.flush().await;
    state.batcher.stop();
    if let Some(workers) = &state.workers {
        workers.shutdown().await;
    }

    Ok(())
}
