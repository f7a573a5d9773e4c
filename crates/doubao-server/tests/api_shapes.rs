//! Wire-shape checks for the OpenAI-compatible surface.
//!
//! These pin the exact JSON clients see, independent of transport.

use doubao_chat::types::{error_body, ChatCompletion, ChatCompletionChunk, ModelList};

/// Buffered completions carry every field OpenAI clients key on.
#[test]
fn test_completion_shape() {
    let completion = ChatCompletion::assistant(
        "chatcmpl-1".into(),
        "doubao-pro-chat".into(),
        "你好！".into(),
    );
    let value = serde_json::to_value(&completion).unwrap();

    assert_eq!(value["id"], "chatcmpl-1");
    assert_eq!(value["object"], "chat.completion");
    assert!(value["created"].is_number());
    assert_eq!(value["model"], "doubao-pro-chat");
    assert_eq!(value["choices"][0]["index"], 0);
    assert_eq!(value["choices"][0]["message"]["role"], "assistant");
    assert_eq!(value["choices"][0]["message"]["content"], "你好！");
    assert_eq!(value["choices"][0]["finish_reason"], "stop");
    assert_eq!(value["usage"]["prompt_tokens"], 0);
    assert_eq!(value["usage"]["completion_tokens"], 0);
    assert_eq!(value["usage"]["total_tokens"], 0);
}

/// Mid-stream chunks carry the text in the delta and no finish reason.
#[test]
fn test_delta_chunk_shape() {
    let chunk = ChatCompletionChunk::delta("chatcmpl-1", "doubao-pro-chat", "片段");
    let value = serde_json::to_value(&chunk).unwrap();

    assert_eq!(value["object"], "chat.completion.chunk");
    assert_eq!(value["choices"][0]["delta"]["content"], "片段");
    assert!(value["choices"][0]["finish_reason"].is_null());
}

/// The terminal chunk holds an empty delta and `finish_reason: "stop"`.
#[test]
fn test_finish_chunk_shape() {
    let chunk = ChatCompletionChunk::finish("chatcmpl-1", "doubao-pro-chat");
    let value = serde_json::to_value(&chunk).unwrap();

    assert_eq!(value["choices"][0]["delta"], serde_json::json!({}));
    assert_eq!(value["choices"][0]["finish_reason"], "stop");
}

/// In-stream failures ride in the delta and finish the stream at once.
#[test]
fn test_error_chunk_shape() {
    let chunk = ChatCompletionChunk::error_text("chatcmpl-1", "doubao-pro-chat", "upstream broke");
    let value = serde_json::to_value(&chunk).unwrap();

    assert_eq!(value["choices"][0]["delta"]["content"], "upstream broke");
    assert_eq!(value["choices"][0]["finish_reason"], "stop");
}

/// Model listings match the `/v1/models` shape.
#[test]
fn test_model_list_shape() {
    let list = ModelList::new(vec!["doubao-pro-chat".to_string()]);
    let value = serde_json::to_value(&list).unwrap();

    assert_eq!(value["object"], "list");
    assert_eq!(value["data"][0]["id"], "doubao-pro-chat");
    assert_eq!(value["data"][0]["object"], "model");
    assert!(value["data"][0]["created"].is_number());
    assert!(value["data"][0]["owned_by"].is_string());
}

/// Error bodies follow the OpenAI error envelope.
#[test]
fn test_error_body_shape() {
    let value = error_body("something failed", "server_error");

    assert_eq!(value["error"]["message"], "something failed");
    assert_eq!(value["error"]["type"], "server_error");
    assert!(value["error"]["code"].is_null());
}
