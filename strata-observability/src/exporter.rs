use crate::metrics::Metrics;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Readiness probe supplied by the daemon (true once the domains
/// source can answer).
pub type ReadyCheck = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone)]
struct ExporterState {
    metrics: Arc<Metrics>,
    ready: ReadyCheck,
}

/// Serve `/metrics` and `/healthz` on the metrics listener. Runs until
/// the process exits.
pub async fn serve(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    ready: ReadyCheck,
) -> anyhow::Result<()> {
    let state = ExporterState { metrics, ready };

    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(healthz))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "metrics endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn render_metrics(State(state): State<ExporterState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.gather_text(),
    )
}

async fn healthz(State(state): State<ExporterState>) -> impl IntoResponse {
    if (state.ready)() {
        (StatusCode::OK, "success")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not yet ready")
    }
}
