//! HTTP server for the bridge control surface.

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;

use super::layouts::{
    delete_layout, get_index, get_layout, handle_healthy, post_retention, put_layout,
};
use super::ws::ws_upgrade;
use super::AppState;

/// Builds the control-surface router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/layouts/index.json", get(get_index))
        .route(
            "/layouts/{file}",
            get(get_layout).put(put_layout).delete(delete_layout),
        )
        .route("/api/layouts/{name}/retention", post(post_retention))
        .route("/ws/{slug}", get(ws_upgrade))
        .route("/-/healthy", get(handle_healthy))
        .with_state(state)
}

/// HTTP server for the bridge.
pub struct BridgeServer {
    state: AppState,
    port: u16,
}

impl BridgeServer {
    pub fn new(state: AppState, port: u16) -> Self {
        Self { state, port }
    }

    /// Runs until SIGINT/SIGTERM, then stops every target manager so open
    /// segments close cleanly. A bind failure propagates to the caller.
    pub async fn run(self) -> anyhow::Result<()> {
        let registry = self.state.registry.clone();
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("bridge listening on {addr}");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        registry.shutdown().await;
        tracing::info!("bridge shut down cleanly");
        Ok(())
    }
}

/// Resolves on the first stop request from the operator: Ctrl+C, or
/// SIGTERM when running under a process supervisor. Target managers (and
/// their open segments) are drained by the caller once this fires.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("SIGTERM received, draining target managers");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("interrupted, draining target managers");
                    }
                }
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable, Ctrl+C only");
            }
        }
    }

    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("interrupted, draining target managers");
}
