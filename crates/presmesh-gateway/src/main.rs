//! presmesh gateway node.
//!
//! One stateless front-end of the presence fabric:
//! - WebSocket endpoint: /v1/ws
//! - Presence service + event bridge + reaper against the shared store
//! - Prometheus metrics at /metrics
//! - Graceful shutdown disposes the presence runtime

use std::net::SocketAddr;

use tracing_subscriber::{fmt, EnvFilter};

use presmesh_gateway::{app_state, config, router};

#[tokio::main]
async fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let path = std::env::var("PRESMESH_CONFIG").unwrap_or_else(|_| "presmesh.yaml".to_string());
    let cfg = config::load_from_file(&path).expect("config load failed");
    let listen: SocketAddr = cfg
        .gateway
        .listen
        .parse()
        .expect("gateway.listen must be a valid SocketAddr");

    let state = app_state::AppState::build(cfg)
        .await
        .expect("presence runtime start failed");
    let app = router::build_router(state.clone());

    tracing::info!(%listen, "presmesh-gateway starting");
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .expect("failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(state))
        .await
        .expect("server failed");
}

async fn shutdown(state: app_state::AppState) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    state.runtime().dispose().await;
}
