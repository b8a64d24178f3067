use crate::request_config;
use crate::AppState;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use coordinator::CoordinatorOutcome;
use futures::StreamExt;
use proxy_core::time::now_secs;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// `GET /v1/models` — always advertises the proxy's configured model id,
/// independent of what any backend reports (§6).
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.config.model_id,
            "object": "model",
            "created": now_secs(),
            "owned_by": "local",
        }]
    }))
}

/// `POST /v1/chat/completions` — the OpenAI-compatible inbound surface
/// (§6). `stream: true` relays backend bytes verbatim as
/// `text/event-stream`; otherwise the backend's JSON body is forwarded
/// as-is.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let stream = body
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let request_config = request_config::extract(&headers, &query, &state.config);

    match state
        .coordinator
        .handle_chat_completion(body, &request_config, stream)
        .await
    {
        Ok(CoordinatorOutcome::Json { status, body }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            (status, Json(body)).into_response()
        }
        Ok(CoordinatorOutcome::Stream { status, bytes }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            let body = Body::from_stream(bytes.map(|chunk| chunk.map_err(std::io::Error::other)));
            Response::builder()
                .status(status)
                .header("content-type", "text/event-stream")
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => {
            let status = StatusCode::from_u16(err.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(err.body)).into_response()
        }
    }
}
