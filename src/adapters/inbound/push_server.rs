//! Push Receiver
//!
//! HTTP endpoint remote nodes push batches to. The body is the line
//! protocol stream; the response body is the acknowledgement lines.

use crate::application::DataLoaderService;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

#[derive(Debug, Deserialize)]
pub struct PushParams {
    #[serde(rename = "nodeId")]
    pub node_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_id: String,
    pub payloads_loaded: u64,
}

#[derive(Clone)]
pub struct PushState {
    pub node_id: String,
    pub loader: Arc<DataLoaderService>,
    pub payloads_loaded: Arc<AtomicU64>,
}

impl PushState {
    pub fn new(node_id: impl Into<String>, loader: Arc<DataLoaderService>) -> Self {
        Self {
            node_id: node_id.into(),
            loader,
            payloads_loaded: Arc::new(AtomicU64::new(0)),
        }
    }
}

pub struct PushServer {
    listen_addr: String,
    state: PushState,
}

impl PushServer {
    pub fn new(listen_addr: String, state: PushState) -> Self {
        Self { listen_addr, state }
    }

    pub fn router(state: PushState) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/sync/push", post(push_handler))
            .with_state(state)
    }

    /// Serve until `shutdown` completes.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = Self::router(self.state.clone()).layer(TraceLayer::new_for_http());
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("push receiver listening on {}", self.listen_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn health_handler(State(state): State<PushState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: state.node_id.clone(),
        payloads_loaded: state.payloads_loaded.load(Ordering::Relaxed),
    })
}

async fn push_handler(
    State(state): State<PushState>,
    Query(params): Query<PushParams>,
    body: String,
) -> impl IntoResponse {
    let Some(remote) = params.node_id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing nodeId".to_string());
    };
    tracing::debug!("receiving {} bytes from {}", body.len(), remote);

    let loader = state.loader.clone();
    match tokio::task::spawn_blocking(move || loader.load_payload(&body)).await {
        Ok(lines) => {
            state.payloads_loaded.fetch_add(1, Ordering::Relaxed);
            let mut text = lines.join("\n");
            text.push('\n');
            (StatusCode::OK, text)
        }
        Err(e) => {
            tracing::error!("loading push from {} panicked: {}", remote, e);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::{SqliteBatchStore, SqliteTargetDatabase};
    use crate::domain::services::WriterSettings;
    use crate::domain::value_objects::NodeId;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    fn create_test_app() -> (NamedTempFile, PushState, Router) {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(SqliteBatchStore::new(temp.path().to_str().unwrap()));
        store.init_db().unwrap();
        let target = SqliteTargetDatabase::open_in_memory().unwrap();
        target
            .connection()
            .execute_batch("CREATE TABLE customer (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        let loader = DataLoaderService::new(
            NodeId::new("store-1"),
            Box::new(target),
            store,
            Arc::new(WriterSettings::default()),
        );
        let state = PushState::new("store-1", Arc::new(loader));
        let app = PushServer::router(state.clone());
        (temp, state, app)
    }

    #[tokio::test]
    async fn test_health_handler() {
        let (_temp, _state, app) = create_test_app();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_push_handler_returns_acks() {
        let (_temp, state, app) = create_test_app();
        let payload = "nodeid,corp\nchannel,sales\nbatch,42\ntable,customer\nkeys,id\ncolumns,id,name\ninsert,\"1\",\"ann\"\ncommit,42\n";
        let request = Request::builder()
            .method("POST")
            .uri("/sync/push?nodeId=corp")
            .body(Body::from(payload))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(text, "42-ok\n42:1:0:0:0\n");
        assert_eq!(state.payloads_loaded.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_push_handler_requires_node_id() {
        let (_temp, _state, app) = create_test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/sync/push")
            .body(Body::from("nodeid,corp\n"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
