mod config;
mod http;
mod metrics;
mod pktline;
mod refs;
mod repo;
#[cfg(test)]
mod test_helpers;
mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tokio::signal;
use tokio::task::JoinSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, Overrides, TlsListen};
use crate::metrics::MetricsRegistry;
use crate::upstream::UpstreamClient;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "gitref-proxy",
    about = "Serve any branch or tag of an upstream Git repository as its default branch"
)]
struct Cli {
    /// Optional YAML configuration file.  Flags take precedence over it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve HTTP on this address (e.g. `:8080`).  Pass an empty string to
    /// disable.
    #[arg(long)]
    http: Option<String>,

    /// Serve HTTPS on this address.  Requires --cert and --key.
    #[arg(long)]
    https: Option<String>,

    /// PEM certificate chain for HTTPS.
    #[arg(long)]
    cert: Option<String>,

    /// PEM private key for HTTPS.
    #[arg(long)]
    key: Option<String>,

    /// Upstream base URL (default `https://github.com`).
    #[arg(long)]
    upstream: Option<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            http: self.http.clone(),
            https: self.https.clone(),
            cert: self.cert.clone(),
            key: self.key.clone(),
            upstream: self.upstream.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub upstream: UpstreamClient,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------------

async fn run_http_server(app: Router, listen_addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")?;

    Ok(())
}

async fn run_https_server(app: Router, tls: TlsListen) -> Result<()> {
    let rustls_config = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
        .await
        .with_context(|| {
            format!(
                "failed to load TLS certificate {} / key {}",
                tls.cert.display(),
                tls.key.display()
            )
        })?;

    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown_signal().await;
            handle.graceful_shutdown(Some(Duration::from_secs(30)));
        }
    });

    tracing::info!(listen_addr = %tls.addr, "HTTPS server listening");

    axum_server::bind_rustls(tls.addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .with_context(|| format!("HTTPS server error on {}", tls.addr))?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- TLS crypto provider (must be installed before any rustls usage) ----
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(cli.config.as_deref(), cli.overrides())?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        config_path = ?cli.config,
        upstream = %config.upstream.base_url,
        "starting gitref-proxy"
    );

    // ---- App state ----
    let state = Arc::new(AppState {
        upstream: UpstreamClient::new(&config.upstream)?,
        metrics: MetricsRegistry::new(),
        config: Arc::clone(&config),
    });
    let app = http::handler::create_router(Arc::clone(&state));

    // ---- Spawn listeners ----
    let mut servers = JoinSet::new();
    if let Some(addr) = state.config.listen.http_addr()? {
        servers.spawn(run_http_server(app.clone(), addr));
    }
    if let Some(tls) = state.config.listen.tls()? {
        servers.spawn(run_https_server(app, tls));
    }

    // ---- Await shutdown ----
    // Both listeners watch the shutdown signal themselves; a listener that
    // fails on its own takes the process down with it.
    while let Some(joined) = servers.join_next().await {
        joined.context("server task panicked")??;
    }

    tracing::info!("gitref-proxy shut down cleanly");
    Ok(())
}
