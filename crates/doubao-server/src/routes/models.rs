//! Model listing and liveness.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use doubao_chat::types::ModelList;

use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    Json(ModelList::new(state.relay.model_ids()))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::routes::testing::test_router;

    async fn get_json(uri: &str) -> (StatusCode, Value) {
        let response = test_router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_service() {
        let (status, value) = get_json("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["status"], "ok");
        assert_eq!(value["service"], "doubao-server");
        assert!(value["version"].is_string());
    }

    #[tokio::test]
    async fn test_models_lists_configured_mapping() {
        let (status, value) = get_json("/v1/models").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(value["object"], "list");
        assert_eq!(value["data"][0]["id"], "doubao-pro-chat");
        assert_eq!(value["data"][0]["object"], "model");
    }
}
