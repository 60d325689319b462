use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use std::{fs::OpenOptions, io::ErrorKind, sync::Arc, sync::Mutex};
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use config::{Args, ServiceConfig};
use services::grid_store;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Parse args + config (errors go to stderr via main's Result) ---
    let args = Args::parse();
    let mut cfg = ServiceConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }

    // --- Logging setup ---
    init_logging(&cfg)?;

    if let Err(err) = run(cfg, args.migrate).await {
        tracing::error!("{:#}", err);
        return Err(err);
    }
    Ok(())
}

async fn run(cfg: ServiceConfig, migrate: bool) -> Result<()> {
    tracing::info!("Starting gridserve with config: {:?}", cfg);

    // --- Handle migration mode ---
    if migrate {
        grid_store::migrate(&cfg).await?;
        tracing::info!("Store schema installed.");
        return Ok(()); // exit after migration
    }

    // --- Connect to the store ---
    let store = grid_store::connect(&cfg)
        .await
        .context("connecting to the store")?;

    // --- Build router ---
    let addr = cfg.addr();
    let state = AppState::new(cfg, Arc::new(store));
    tracing::info!(
        field = state.retrieval.mode().field_name(),
        prefix = %state.config.handle_path,
        "serving stored files"
    );
    let app: Router = routes::routes::routes(&state.config.handle_path).with_state(state);

    // --- Start server ---
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            let Some(fallback_addr) = loopback_fallback(&addr) else {
                return Err(err).with_context(|| format!("binding {}", addr));
            };
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err).with_context(|| format!("binding {}", addr)),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Loopback address on the same port, for wildcard hosts only.
fn loopback_fallback(addr: &str) -> Option<String> {
    let (host, port) = addr.rsplit_once(':')?;
    matches!(host, "0.0.0.0" | "[::]").then(|| format!("127.0.0.1:{}", port))
}

type BoxedSubscriber = Box<dyn tracing::Subscriber + Send + Sync>;

fn init_logging(cfg: &ServiceConfig) -> Result<()> {
    log_subscriber(cfg)?
        .try_init()
        .context("installing the log subscriber")
}

/// Log to stdout, or append to `logfile` when one is configured.
/// `RUST_LOG` overrides the level picked from the `debug` flag.
fn log_subscriber(cfg: &ServiceConfig) -> Result<BoxedSubscriber> {
    let default_level = if cfg.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if cfg.logfile.is_empty() {
        return Ok(Box::new(builder.finish()));
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.logfile)
        .with_context(|| format!("opening log file `{}`", cfg.logfile))?;
    Ok(Box::new(
        builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .finish(),
    ))
}
