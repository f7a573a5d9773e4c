//! Chat turn orchestration.
//!
//! One turn runs the full pipeline: pick a credential, fold in the
//! rolling token, sign the upstream URL through the browser, POST the
//! payload and translate the upstream stream into turn events. All
//! failures past model validation surface in-stream, because by then a
//! streaming client has already received response headers.

use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use uuid::Uuid;

use doubao_core::{Error, RelayConfig};
use doubao_signer::Signer;

use crate::cookie::with_current_token;
use crate::credentials::CredentialPool;
use crate::events::{decode_event, UpstreamEvent};
use crate::sessions::SessionStore;
use crate::types::{ChatCompletionRequest, ChatMessage};

pub const UPSTREAM_URL: &str = "https://www.doubao.com/samantha/chat/completion";

/// Conversation id marking a session with no upstream conversation yet.
/// Clients never see it and it is never sent as a real id.
pub const NEW_CONVERSATION: &str = "0";

const TOKEN_HEADER: &str = "x-ms-token";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/141.0.0.0 Safari/537.36";

/// Static query parameters every upstream call carries. The signer merges
/// these with the device fingerprint before signing.
const BASE_PARAMS: [(&str, &str); 11] = [
    ("aid", "497858"),
    ("device_platform", "web"),
    ("language", "zh"),
    ("pc_version", "2.41.0"),
    ("pkg_type", "release_version"),
    ("real_aid", "497858"),
    ("region", "CN"),
    ("samantha_web", "1"),
    ("sys_region", "CN"),
    ("use-olympus-account", "1"),
    ("version_code", "20800"),
];

/// Events produced while relaying one chat turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// Assistant text fragment, in arrival order.
    Delta(String),
    /// Upstream finished cleanly.
    Done,
    /// The turn failed; carries the message shown to the client.
    Failed(String),
}

pub type TurnStream = Pin<Box<dyn Stream<Item = TurnEvent> + Send>>;

/// A validated turn ready to run.
pub struct Turn {
    pub request_id: String,
    pub model: String,
    pub events: TurnStream,
}

/// One translated upstream line worth acting on.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TranslatorItem {
    Delta(String),
    Created(String),
    /// Body ended cleanly; `active` is false when not a single line arrived.
    End { active: bool },
    /// Transport failed mid-body; any partial tail line is discarded.
    Failed(String),
}

pub struct ChatRelay {
    config: RelayConfig,
    signer: Arc<dyn Signer>,
    pool: CredentialPool,
    sessions: SessionStore,
    http: reqwest::Client,
}

impl ChatRelay {
    pub fn new(config: RelayConfig, signer: Arc<dyn Signer>) -> Result<Self, Error> {
        let pool = CredentialPool::new(config.cookies.clone())?;
        let sessions = SessionStore::new(config.session_ttl);
        // Only the connect phase is bounded; a healthy turn may stream
        // for longer than any fixed deadline. Redirects are never
        // followed, so a 3xx surfaces as a rejection.
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            config,
            signer,
            pool,
            sessions,
            http,
        })
    }

    /// Exposed model ids, stable order.
    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.config.model_mapping.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Validate a request and build its turn.
    ///
    /// Model resolution is the only failure reported here; it happens
    /// before any credential or signer work so a bad model never touches
    /// the browser.
    pub fn start_turn(self: Arc<Self>, request: ChatCompletionRequest) -> Result<Turn, Error> {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());
        let bot_id = self
            .config
            .model_mapping
            .get(&model)
            .cloned()
            .ok_or_else(|| Error::UnknownModel(model.clone()))?;
        let session_key = request
            .user
            .clone()
            .unwrap_or_else(|| format!("session-{}", Uuid::new_v4().simple()));
        let request_id = format!("chatcmpl-{}", Uuid::new_v4());

        let events = self.run_turn(request, bot_id, session_key);
        Ok(Turn {
            request_id,
            model,
            events,
        })
    }

    fn run_turn(
        self: Arc<Self>,
        request: ChatCompletionRequest,
        bot_id: String,
        session_key: String,
    ) -> TurnStream {
        Box::pin(stream! {
            let conversation_id = self
                .sessions
                .get(&session_key)
                .unwrap_or_else(|| NEW_CONVERSATION.to_string());
            let starts_new = conversation_id == NEW_CONVERSATION;

            let payload = match build_payload(&request.messages, &bot_id, &conversation_id) {
                Ok(payload) => payload,
                Err(e) => {
                    yield TurnEvent::Failed(e.to_string());
                    return;
                }
            };

            let cookie = with_current_token(
                &self.pool.next_cookie(),
                self.signer.current_token().as_deref(),
            );
            let headers = match upstream_headers(&cookie) {
                Ok(headers) => headers,
                Err(e) => {
                    yield TurnEvent::Failed(e.to_string());
                    return;
                }
            };

            tracing::debug!(conversation = %conversation_id, payload = %payload, "upstream turn");

            let signed_url = match self.signer.signed_url(UPSTREAM_URL, &BASE_PARAMS).await {
                Ok(url) => url,
                Err(e) => {
                    tracing::error!("signing failed: {e}");
                    yield TurnEvent::Failed(Error::from(e).to_string());
                    return;
                }
            };

            let response = match self
                .http
                .post(&signed_url)
                .headers(headers)
                .json(&payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    yield TurnEvent::Failed(Error::Http(e.to_string()).to_string());
                    return;
                }
            };

            let status = response.status();
            let token = response
                .headers()
                .get(TOKEN_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = match accept_response(
                self.signer.as_ref(),
                status,
                token,
                response.bytes_stream(),
            )
            .await
            {
                Ok(body) => body,
                Err(e) => {
                    yield TurnEvent::Failed(e.to_string());
                    return;
                }
            };

            let mut events = self
                .clone()
                .turn_events(translate_body(body), starts_new, session_key);
            while let Some(event) = events.next().await {
                yield event;
            }
        })
    }

    /// Map translated items onto client-facing turn events and close out
    /// the turn. A transport failure ends the turn immediately and never
    /// touches the session store.
    fn turn_events<S>(
        self: Arc<Self>,
        items: S,
        starts_new: bool,
        session_key: String,
    ) -> TurnStream
    where
        S: Stream<Item = TranslatorItem> + Send + 'static,
    {
        Box::pin(stream! {
            let mut items = Box::pin(items);
            let mut conversation: Option<String> = None;
            let mut active = false;
            while let Some(item) = items.next().await {
                match item {
                    TranslatorItem::Delta(text) => yield TurnEvent::Delta(text),
                    TranslatorItem::Created(id) => conversation = Some(id),
                    TranslatorItem::End { active: saw_lines } => active = saw_lines,
                    TranslatorItem::Failed(message) => {
                        let err = Error::Http(message);
                        tracing::error!("upstream stream failed mid-body: {err}");
                        yield TurnEvent::Failed(err.to_string());
                        return;
                    }
                }
            }
            yield self.finish_turn(starts_new, &session_key, conversation, active);
        })
    }

    /// Session bookkeeping once the upstream body ends. A conversation id
    /// is persisted only for turns that started at the sentinel; resumed
    /// turns never rebind their session.
    fn finish_turn(
        &self,
        starts_new: bool,
        session_key: &str,
        conversation: Option<String>,
        active: bool,
    ) -> TurnEvent {
        if !active {
            tracing::error!("upstream accepted the turn but sent nothing; cookie may be dead");
            return TurnEvent::Failed(Error::UpstreamSilent.to_string());
        }
        if starts_new {
            if let Some(id) = conversation {
                tracing::info!(session = %session_key, conversation = %id, "session established");
                self.sessions.put(session_key, id);
            }
        }
        TurnEvent::Done
    }
}

/// Drain a turn into the final assistant text. Used by the buffered
/// completion path.
pub async fn collect_turn(mut events: TurnStream) -> Result<String, String> {
    let mut content = String::new();
    while let Some(event) = events.next().await {
        match event {
            TurnEvent::Delta(text) => content.push_str(&text),
            TurnEvent::Done => return Ok(content),
            TurnEvent::Failed(message) => return Err(message),
        }
    }
    Err(Error::UpstreamSilent.to_string())
}

/// Fold a response's token refresh into the signer, then gate on status.
///
/// The upstream rotates the token on every response, including
/// rejections, so the refresh happens before the status check. A non-OK
/// status drains the body as the rejection message.
async fn accept_response<B, C, E>(
    signer: &dyn Signer,
    status: reqwest::StatusCode,
    token: Option<String>,
    body: B,
) -> Result<B, Error>
where
    B: Stream<Item = Result<C, E>> + Send,
    C: AsRef<[u8]>,
    E: std::fmt::Display,
{
    if let Some(token) = token {
        signer.update_token(token);
    }
    if status != reqwest::StatusCode::OK {
        let body = read_body_text(body).await;
        tracing::error!(status = status.as_u16(), body = %body, "upstream rejected the turn");
        return Err(Error::UpstreamRejected {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

/// Drain a body into text for error reporting.
async fn read_body_text<B, C, E>(body: B) -> String
where
    B: Stream<Item = Result<C, E>> + Send,
    C: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut body = Box::pin(body);
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(chunk) => bytes.extend_from_slice(chunk.as_ref()),
            Err(e) => {
                tracing::debug!("while reading a rejection body: {e}");
                break;
            }
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Translate the upstream byte stream into items, line by line.
///
/// Bytes are buffered until a newline so multi-byte characters split
/// across network chunks decode intact. Every received line counts as
/// activity, whether or not it carries data. The first announced
/// conversation id wins; later ones are dropped here. A transport error
/// mid-body fails the stream instead of ending it.
fn translate_body<B, C, E>(body: B) -> impl Stream<Item = TranslatorItem> + Send
where
    B: Stream<Item = Result<C, E>> + Send + 'static,
    C: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    stream! {
        let mut body = Box::pin(body);
        let mut buffer: Vec<u8> = Vec::new();
        let mut active = false;
        let mut created = false;
        let mut done = false;
        while !done {
            match body.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    tracing::warn!("upstream body error: {e}");
                    yield TranslatorItem::Failed(e.to_string());
                    return;
                }
                None => done = true,
            }
            // A final line without a newline still counts.
            if done && buffer.last().is_some_and(|b| *b != b'\n') {
                buffer.push(b'\n');
            }
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]);
                active = true;
                for item in translate_line(line.trim_end_matches('\r')) {
                    if matches!(item, TranslatorItem::Created(_)) {
                        if created {
                            continue;
                        }
                        created = true;
                    }
                    yield item;
                }
            }
        }
        yield TranslatorItem::End { active };
    }
}

/// Translate one line of the upstream stream.
fn translate_line(line: &str) -> Vec<TranslatorItem> {
    let Some(rest) = line.strip_prefix("data:") else {
        return Vec::new();
    };
    let payload = rest.trim();
    if payload.is_empty() {
        return Vec::new();
    }
    match decode_event(payload) {
        Ok(UpstreamEvent::Delta(text)) if !text.is_empty() => vec![TranslatorItem::Delta(text)],
        Ok(UpstreamEvent::Created { conversation_id }) => {
            vec![TranslatorItem::Created(conversation_id)]
        }
        Ok(_) => Vec::new(),
        Err(e) => {
            tracing::warn!(line = payload, "skipping undecodable stream line: {e}");
            Vec::new()
        }
    }
}

/// Build the upstream chat payload.
///
/// Only the newest user message goes upstream; history lives in the
/// upstream conversation itself. `bot_id` is attached only when resuming,
/// and `need_create_conversation` only when starting fresh.
fn build_payload(
    messages: &[ChatMessage],
    bot_id: &str,
    conversation_id: &str,
) -> Result<Value, Error> {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .ok_or(Error::MissingUserMessage)?;
    let content = serde_json::to_string(&json!({ "text": last_user.content }))?;

    let mut payload = json!({
        "messages": [{
            "content": content,
            "content_type": 2001,
            "attachments": [],
            "references": [],
        }],
        "completion_option": {
            "is_regen": false,
            "with_suggest": true,
            "need_create_conversation": conversation_id == NEW_CONVERSATION,
            "launch_stage": 1,
            "is_replace": false,
            "is_delete": false,
            "message_from": 0,
            "action_bar_skill_id": 0,
            "use_deep_think": false,
            "use_auto_cot": true,
            "resend_for_regen": false,
            "enable_commerce_credit": false,
            "event_id": "0",
        },
        "evaluate_option": { "web_ab_params": "" },
        "conversation_id": conversation_id,
        "local_conversation_id": format!("local_{}", Uuid::new_v4().simple()),
        "local_message_id": Uuid::new_v4().to_string(),
    });

    if conversation_id != NEW_CONVERSATION {
        payload["bot_id"] = json!(bot_id);
    }

    Ok(payload)
}

/// Fixed browser headers the upstream expects, plus the account cookie.
fn upstream_headers(cookie: &str) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    headers.insert("Accept", HeaderValue::from_static("*/*"));
    headers.insert(
        "Accept-Language",
        HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
    );
    headers.insert("Content-Type", HeaderValue::from_static("application/json"));
    headers.insert(
        "Cookie",
        HeaderValue::from_str(cookie).map_err(|e| Error::Http(format!("cookie header: {e}")))?,
    );
    headers.insert("Origin", HeaderValue::from_static("https://www.doubao.com"));
    headers.insert(
        "Referer",
        HeaderValue::from_static("https://www.doubao.com/chat/"),
    );
    headers.insert("User-Agent", HeaderValue::from_static(USER_AGENT));
    headers.insert("agw-js-conv", HeaderValue::from_static("str, str"));
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static(
            "\"Google Chrome\";v=\"141\", \"Not?A_Brand\";v=\"8\", \"Chromium\";v=\"141\"",
        ),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));
    Ok(headers)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
