//! Chat completion endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio_stream::{Stream, StreamExt};

use doubao_chat::types::{
    error_body, ChatCompletion, ChatCompletionChunk, ChatCompletionRequest,
};
use doubao_chat::{collect_turn, Turn, TurnEvent};
use doubao_core::Error;

use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/v1/chat/completions", post(chat_completions))
}

/// OpenAI-compatible chat completions, streaming or buffered depending
/// on the request's `stream` flag.
///
/// Model validation fails with a plain HTTP error in both modes; every
/// later failure arrives in-stream, since by then streaming clients hold
/// a 200 response.
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let streaming = request.stream;
    let turn = match state.relay.clone().start_turn(request) {
        Ok(turn) => turn,
        Err(e) => return reject(&e),
    };
    if streaming {
        stream_completion(turn).into_response()
    } else {
        buffered_completion(turn).await.into_response()
    }
}

fn reject(error: &Error) -> Response {
    let (status, kind) = if error.is_client_error() {
        (StatusCode::BAD_REQUEST, "invalid_request_error")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
    };
    (status, Json(error_body(&error.to_string(), kind))).into_response()
}

async fn buffered_completion(turn: Turn) -> Response {
    match collect_turn(turn.events).await {
        Ok(content) => Json(ChatCompletion::assistant(
            turn.request_id,
            turn.model,
            content,
        ))
        .into_response(),
        Err(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(error_body(&message, "server_error")),
        )
            .into_response(),
    }
}

fn stream_completion(turn: Turn) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let Turn {
        request_id,
        model,
        mut events,
    } = turn;
    let sse = stream! {
        while let Some(event) = events.next().await {
            match event {
                TurnEvent::Delta(text) => {
                    yield sse_json(&ChatCompletionChunk::delta(&request_id, &model, text));
                }
                TurnEvent::Done => {
                    yield sse_json(&ChatCompletionChunk::finish(&request_id, &model));
                    break;
                }
                TurnEvent::Failed(message) => {
                    yield sse_json(&ChatCompletionChunk::error_text(&request_id, &model, message));
                    break;
                }
            }
        }
        yield Ok(Event::default().data("[DONE]"));
    };
    Sse::new(sse)
}

fn sse_json<T: serde::Serialize>(value: &T) -> Result<Event, Infallible> {
    Ok(Event::default().data(serde_json::to_string(value).unwrap()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use doubao_chat::TurnStream;

    use super::*;
    use crate::routes::testing::test_router;

    fn completion_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn synthetic_turn(events: Vec<TurnEvent>) -> Turn {
        let events: TurnStream = Box::pin(tokio_stream::iter(events));
        Turn {
            request_id: "chatcmpl-test".into(),
            model: "doubao-pro-chat".into(),
            events,
        }
    }

    #[tokio::test]
    async fn test_unknown_model_rejected_before_any_work() {
        let response = test_router()
            .oneshot(completion_request(json!({
                "model": "gpt-4o",
                "messages": [{ "role": "user", "content": "hi" }],
                "stream": false
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = body_json(response).await;
        assert_eq!(value["error"]["type"], "invalid_request_error");
        assert!(value["error"]["message"].as_str().unwrap().contains("gpt-4o"));
    }

    #[tokio::test]
    async fn test_unknown_model_rejected_for_streams_too() {
        let response = test_router()
            .oneshot(completion_request(json!({
                "model": "gpt-4o",
                "messages": [{ "role": "user", "content": "hi" }],
                "stream": true
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stream_ends_with_stop_chunk_and_done_marker() {
        let turn = synthetic_turn(vec![
            TurnEvent::Delta("Hel".into()),
            TurnEvent::Delta("lo".into()),
            TurnEvent::Done,
        ]);
        let response = stream_completion(turn).into_response();
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );

        let text = body_text(response).await;
        let frames: Vec<&str> = text
            .split("\n\n")
            .filter(|frame| !frame.is_empty())
            .collect();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[3], "data: [DONE]");

        let first: Value =
            serde_json::from_str(frames[0].strip_prefix("data: ").unwrap()).unwrap();
        assert_eq!(first["choices"][0]["delta"]["content"], "Hel");
        assert!(first["choices"][0]["finish_reason"].is_null());

        let last: Value =
            serde_json::from_str(frames[2].strip_prefix("data: ").unwrap()).unwrap();
        assert_eq!(last["choices"][0]["delta"], json!({}));
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn test_failed_turn_streams_one_error_chunk_then_done() {
        let turn = synthetic_turn(vec![TurnEvent::Failed("upstream broke".into())]);
        let response = stream_completion(turn).into_response();

        let text = body_text(response).await;
        let frames: Vec<&str> = text
            .split("\n\n")
            .filter(|frame| !frame.is_empty())
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], "data: [DONE]");

        let chunk: Value =
            serde_json::from_str(frames[0].strip_prefix("data: ").unwrap()).unwrap();
        assert_eq!(chunk["choices"][0]["delta"]["content"], "upstream broke");
        assert_eq!(chunk["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn test_buffered_turn_concatenates_deltas() {
        let turn = synthetic_turn(vec![
            TurnEvent::Delta("Hel".into()),
            TurnEvent::Delta("lo".into()),
            TurnEvent::Done,
        ]);
        let response = buffered_completion(turn).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = body_json(response).await;
        assert_eq!(value["id"], "chatcmpl-test");
        assert_eq!(value["choices"][0]["message"]["content"], "Hello");
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn test_missing_user_message_is_a_server_error() {
        let response = test_router()
            .oneshot(completion_request(json!({
                "model": "doubao-pro-chat",
                "messages": [{ "role": "system", "content": "be brief" }],
                "stream": false
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let value = body_json(response).await;
        assert_eq!(value["error"]["type"], "server_error");
        assert!(value["error"]["message"]
            .as_str()
            .unwrap()
            .contains("No user message"));
    }
}
