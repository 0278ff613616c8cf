//! HTTP exposition of the metric store.
//!
//! * `GET /metrics` - Prometheus text format
//! * `GET /metrics.json` - the same snapshot as JSON
//!
//! Optionally the Prometheus text is also written to a node_exporter
//! textfile collector file after every pass, see [`textfile`].

use crate::store::{MetricStore, Snapshot};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use prometheus::TEXT_FORMAT;
use ringlog::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;

pub mod textfile;

pub fn router(store: MetricStore) -> Router {
    Router::new()
        .route("/metrics", get(prometheus))
        .route("/metrics.json", get(json))
        .with_state(store)
}

/// Serves until the shutdown flag is raised, then finishes in-flight
/// requests.
pub async fn serve(
    listener: TcpListener,
    store: MetricStore,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("serving metrics on http://{addr}/metrics");
    }

    axum::serve(listener, router(store))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("exporter shutting down");
        })
        .await
}

async fn prometheus(State(store): State<MetricStore>) -> Response {
    match store.snapshot().to_prometheus() {
        Ok(text) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], text).into_response(),
        Err(e) => {
            warn!("failed to encode metrics: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

async fn json(State(store): State<MetricStore>) -> Json<Snapshot> {
    Json(store.snapshot())
}
