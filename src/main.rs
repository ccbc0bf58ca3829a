use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod auth;
mod error;
mod ledger;
mod pipeline;
mod rate_limit;
mod registry;
mod relay;
mod sessions;
mod settings;
mod tiering;
mod upstream;

use pipeline::Gateway;
use settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gonka_gateway=info,tower_http=warn".into()),
        )
        .init();

    let settings = Settings::from_env().context("reading GONKA_* environment")?;
    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("creating data dir {}", settings.data_dir.display()))?;

    let gateway = Arc::new(Gateway::new(settings).context("building gateway state")?);

    // Dev bootstrap: an empty credential store is unusable, so mint a key.
    if gateway.credentials.key_count() == 0 {
        let dev_key = format!("gk-dev-{}", "0".repeat(48));
        gateway
            .credentials
            .add(&dev_key, "development", "premium", 1000, 10_000_000)
            .context("creating dev API key")?;
        info!(key = %dev_key, "no API keys configured — dev key created");
    }

    // Initial catalog load. A missing file just means an empty registry
    // until the first reload; a malformed one is a startup error.
    let catalog_path = gateway.settings.models_config.clone();
    if catalog_path.exists() {
        let count =
            registry::load_and_install(&catalog_path, &gateway.registry, &gateway.tiering)
                .with_context(|| format!("loading model catalog {}", catalog_path.display()))?;
        info!(models = count, path = %catalog_path.display(), "model catalog loaded");
    } else {
        warn!(path = %catalog_path.display(), "model catalog not found — registry is empty");
    }

    tokio::spawn(session_sweeper(Arc::clone(&gateway)));
    tokio::spawn(catalog_watcher(Arc::clone(&gateway)));

    let addr: SocketAddr =
        format!("{}:{}", gateway.settings.gateway_host, gateway.settings.gateway_port)
            .parse()
            .context("parsing bind address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = api::router(gateway).layer(trace_layer);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
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
}

/// Background task: sweep expired sessions every 5 minutes.
async fn session_sweeper(gateway: Arc<Gateway>) {
    let mut interval = tokio::time::interval(Duration::from_secs(300));
    interval.tick().await; // skip the immediate first tick

    loop {
        interval.tick().await;
        let removed = gateway.sessions.cleanup_expired();
        if removed > 0 {
            info!(removed, "expired sessions swept");
        }
    }
}

/// Background task: poll the catalog file's mtime every 5 seconds and
/// hot-reload on change.
///
/// Uses filesystem mtime only — no inotify/kqueue dependencies. A failed
/// reload is logged and the live registry keeps serving the previous
/// catalog; serving is never interrupted by a bad config edit.
async fn catalog_watcher(gateway: Arc<Gateway>) {
    let path = gateway.settings.models_config.clone();

    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await; // skip the immediate first tick

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match registry::load_and_install(&path, &gateway.registry, &gateway.tiering) {
            Ok(count) => {
                info!(models = count, path = %path.display(), "model catalog hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "catalog reload failed — keeping previous catalog");
            }
        }
    }
}
