//! Upstream stream envelope decoding.
//!
//! The chat stream nests JSON as strings twice: the envelope's
//! `event_data` field is a JSON string, and for message events the
//! `content` inside it is another JSON string holding the visible text.

use serde::Deserialize;

use doubao_core::Error;

const EVENT_MESSAGE: i64 = 2001;
const EVENT_CONVERSATION: i64 = 2002;

/// A decoded upstream event the relay acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Assistant text fragment; may be empty.
    Delta(String),
    /// New conversation created upstream.
    Created { conversation_id: String },
    /// Well-formed envelope carrying nothing the relay uses.
    Unrecognized,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    event_type: i64,
    #[serde(default = "empty_object")]
    event_data: String,
}

#[derive(Deserialize)]
struct ConversationData {
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Deserialize)]
struct MessageData {
    #[serde(default)]
    message: Option<MessageBody>,
}

#[derive(Deserialize)]
struct MessageBody {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    text: String,
}

fn empty_object() -> String {
    "{}".to_string()
}

/// Decode one `data:` payload into an event.
///
/// Fails only on malformed JSON at any nesting level; unknown event
/// types and absent fields decode to [`UpstreamEvent::Unrecognized`].
pub fn decode_event(payload: &str) -> Result<UpstreamEvent, Error> {
    let envelope: Envelope = serde_json::from_str(payload)?;
    match envelope.event_type {
        EVENT_CONVERSATION => {
            let data: ConversationData = serde_json::from_str(&envelope.event_data)?;
            match data.conversation_id {
                Some(conversation_id) => Ok(UpstreamEvent::Created { conversation_id }),
                None => Ok(UpstreamEvent::Unrecognized),
            }
        }
        EVENT_MESSAGE => {
            let data: MessageData = serde_json::from_str(&envelope.event_data)?;
            let content_raw = data
                .message
                .and_then(|m| m.content)
                .unwrap_or_else(empty_object);
            let content: MessageContent = serde_json::from_str(&content_raw)?;
            Ok(UpstreamEvent::Delta(content.text))
        }
        _ => Ok(UpstreamEvent::Unrecognized),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
