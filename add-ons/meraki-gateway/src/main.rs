//! Axum-based voice gateway: one WebSocket per conversation session.
//! All provider API keys stay in the backend; the frontend is a stateless
//! audio client and never sees them.

mod ws;

use std::sync::Arc;

use axum::{routing::get, Router};
use dashmap::DashMap;
use meraki_voice::SessionConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ws::{healthz, ws_handler, AppState};

pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    // Load .env first so every provider key is visible before anything
    // reads configuration.
    if let Err(e) = dotenvy::dotenv() {
        eprintln!(
            "[meraki-gateway] .env not loaded: {} (using system environment)",
            e
        );
    }
    for key in [
        "ASSEMBLYAI_API_KEY",
        "GEMINI_API_KEY",
        "MURF_API_KEY",
    ] {
        if std::env::var(key).is_err() {
            eprintln!(
                "[meraki-gateway] Hint: {} is not set; sessions will fail to open until it is.",
                key
            );
        }
    }
    if std::env::var("NEWS_API_KEY").is_err() {
        eprintln!("[meraki-gateway] Hint: NEWS_API_KEY not set; headline lookups are disabled.");
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = AppState {
        config: SessionConfig::from_env(),
        sessions: Arc::new(DashMap::new()),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state);

    let bind = std::env::var("MERAKI_BIND").unwrap_or_else(|_| "127.0.0.1:8000".to_string());
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Cannot bind {}: {}", bind, e);
            return;
        }
    };
    tracing::info!("meraki-gateway v{} listening on {}", GATEWAY_VERSION, bind);

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }
}
