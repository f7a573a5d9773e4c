//! Minimal DevTools protocol client.
//!
//! One WebSocket connection per page target. Commands get sequential ids
//! and their replies are routed back to the caller through oneshot
//! channels; everything without an id is a protocol event and goes out
//! on the event channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::SignerError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<CdpReply>>>>;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A protocol notification pushed by the browser.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

/// Error object attached to a failed command reply.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpError {
    pub code: i64,
    pub message: String,
}

/// Reply to a single command: either a result object or an error.
#[derive(Debug)]
struct CdpReply {
    result: Option<Value>,
    error: Option<CdpError>,
}

pub struct CdpClient {
    sink: tokio::sync::Mutex<WsSink>,
    pending: PendingMap,
    next_id: AtomicU64,
    reader: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a DevTools WebSocket endpoint.
    ///
    /// Returns the client and the stream of protocol events. Dropping the
    /// receiver is fine; events are discarded once nobody listens.
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CdpEvent>), SignerError> {
        let (stream, _) =
            connect_async(url)
                .await
                .map_err(|e| SignerError::ConnectionFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        let (sink, source) = stream.split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(source, Arc::clone(&pending), event_tx));

        Ok((
            Self {
                sink: tokio::sync::Mutex::new(sink),
                pending,
                next_id: AtomicU64::new(1),
                reader,
            },
            event_rx,
        ))
    }

    /// Send a command and wait for its reply with the default timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, SignerError> {
        self.call_with_timeout(method, params, DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, SignerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = command_frame(id, method, &params);
        {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(Message::Text(frame)).await {
                self.pending.lock().remove(&id);
                return Err(SignerError::Protocol(format!("command send failed: {e}")));
            }
        }

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(SignerError::Protocol("browser connection closed".into()));
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(SignerError::CommandTimeout {
                    method: method.to_string(),
                    timeout,
                });
            }
        };

        match reply {
            CdpReply {
                error: Some(err), ..
            } => Err(SignerError::Cdp {
                code: err.code,
                message: err.message,
            }),
            CdpReply { result, .. } => Ok(result.unwrap_or(Value::Null)),
        }
    }

    /// Close the socket and stop the reader task.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        self.reader.abort();
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut source: SplitStream<WsStream>,
    pending: PendingMap,
    events: mpsc::UnboundedSender<CdpEvent>,
) {
    while let Some(message) = source.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("discarding unparseable DevTools frame: {e}");
                continue;
            }
        };
        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            if let Some(tx) = pending.lock().remove(&id) {
                let _ = tx.send(parse_reply(value));
            }
        } else if let Some(event) = parse_event(value) {
            let _ = events.send(event);
        }
    }
    // Dropping the senders wakes every caller still waiting on a reply.
    pending.lock().clear();
}

fn command_frame(id: u64, method: &str, params: &Value) -> String {
    json!({ "id": id, "method": method, "params": params }).to_string()
}

fn parse_reply(value: Value) -> CdpReply {
    let error = value
        .get("error")
        .and_then(|e| serde_json::from_value(e.clone()).ok());
    let result = value.get("result").cloned();
    CdpReply { result, error }
}

fn parse_event(value: Value) -> Option<CdpEvent> {
    let method = value.get("method")?.as_str()?.to_string();
    let params = value.get("params").cloned().unwrap_or(Value::Null);
    Some(CdpEvent { method, params })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
