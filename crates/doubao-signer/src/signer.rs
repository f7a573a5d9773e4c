//! Browser-backed request signing.
//!
//! One Chrome page stays parked on the chat site so that its anti-abuse
//! script (`window.byted_acrawler`) is loaded and primed with the
//! account cookie. Signing a request means serializing the query
//! parameters, calling `frontierSign` on the page and appending the
//! returned `a_bogus` value. The rolling `msToken` is captured passively
//! from response headers flowing through the page and folded into every
//! signed query.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use doubao_core::config::Fingerprint;

use crate::cdp::{CdpClient, CdpEvent};
use crate::chrome::ChromeProcess;
use crate::cookies::parse_cookie_pairs;
use crate::error::SignerError;

const SIGNING_PAGE: &str = "https://www.doubao.com/chat/";
const COOKIE_DOMAIN: &str = ".doubao.com";
const TOKEN_HEADER: &str = "x-ms-token";

const PAGE_LOAD_TIMEOUT: Duration = Duration::from_secs(60);
const ENTRY_POINT_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Hides the automation flag before any page script runs.
const STEALTH_SCRIPT: &str =
    "Object.defineProperty(navigator, 'webdriver', {get: () => undefined})";
const ENTRY_POINT_PROBE: &str = "typeof window.byted_acrawler?.frontierSign === 'function'";

/// Produces signed upstream URLs and tracks the rolling anti-abuse token.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign `base_url` with `params` plus the device fingerprint and the
    /// current token. Returns the full URL to request.
    async fn signed_url(
        &self,
        base_url: &str,
        params: &[(&str, &str)],
    ) -> Result<String, SignerError>;

    /// Last captured rolling token, if any.
    fn current_token(&self) -> Option<String>;

    /// Record a fresher token seen on an upstream response.
    fn update_token(&self, token: String);
}

struct Browser {
    chrome: ChromeProcess,
    cdp: CdpClient,
    load_events: watch::Receiver<u64>,
}

pub struct BrowserSigner {
    // Serializes page access: one signing call at a time, and never
    // concurrently with shutdown.
    browser: tokio::sync::Mutex<Browser>,
    token: Arc<RwLock<Option<String>>>,
    fingerprint: Fingerprint,
}

impl BrowserSigner {
    /// Launch Chrome, install the account cookie, park on the chat page
    /// and wait until the signing function is callable.
    ///
    /// A missing initial token is not fatal; the first upstream response
    /// usually delivers one. A missing signing function is fatal since it
    /// almost always means the cookie is dead.
    pub async fn launch(
        fingerprint: Fingerprint,
        cookie_header: &str,
        debug_port: u16,
        headless: bool,
    ) -> Result<Self, SignerError> {
        let chrome = ChromeProcess::launch(debug_port, headless).await?;
        let ws_url = chrome.page_ws_url().await?;
        let (cdp, events) = CdpClient::connect(&ws_url).await?;

        cdp.call("Network.enable", json!({})).await?;
        cdp.call("Page.enable", json!({})).await?;
        cdp.call("Runtime.enable", json!({})).await?;
        cdp.call(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({ "source": STEALTH_SCRIPT }),
        )
        .await?;

        for cookie in parse_cookie_pairs(cookie_header, COOKIE_DOMAIN) {
            cdp.call("Network.setCookie", serde_json::to_value(&cookie)?)
                .await?;
        }

        let (load_tx, load_rx) = watch::channel(0u64);
        let token = Arc::new(RwLock::new(None));
        tokio::spawn(pump_events(events, load_tx, Arc::clone(&token)));

        let mut browser = Browser {
            chrome,
            cdp,
            load_events: load_rx,
        };

        tracing::info!(url = SIGNING_PAGE, "loading signing page");
        navigate(&browser.cdp, &mut browser.load_events, SIGNING_PAGE).await?;
        wait_for_entry_point(&browser.cdp).await?;
        tracing::info!("signing function is ready");

        if !wait_for_initial_token(&token).await {
            tracing::warn!(
                "no rolling token captured during startup; requests will fail until one arrives"
            );
        }

        Ok(Self {
            browser: tokio::sync::Mutex::new(browser),
            token,
            fingerprint,
        })
    }

    /// Close the page connection and kill the browser process.
    pub async fn close(&self) {
        let mut guard = self.browser.lock().await;
        guard.cdp.close().await;
        guard.chrome.kill().await;
        tracing::info!("signing browser shut down");
    }
}

#[async_trait]
impl Signer for BrowserSigner {
    async fn signed_url(
        &self,
        base_url: &str,
        params: &[(&str, &str)],
    ) -> Result<String, SignerError> {
        let browser = self.browser.lock().await;

        let token = self
            .token
            .read()
            .clone()
            .ok_or(SignerError::TokenMissing)?;
        let web_tab_id = Uuid::new_v4().to_string();

        let mut pairs: Vec<(&str, &str)> = params.to_vec();
        pairs.extend(self.fingerprint.as_params());
        pairs.push(("web_tab_id", &web_tab_id));
        pairs.push(("msToken", &token));

        let query = canonical_query(&pairs);
        // The query is form-urlencoded, so embedding it in a JS string
        // literal needs no further escaping.
        let expression = format!("window.byted_acrawler.frontierSign(\"{query}\")");
        let result = evaluate(&browser.cdp, &expression).await?;

        let signature = result
            .get("a_bogus")
            .or_else(|| result.get("X-Bogus"))
            .and_then(Value::as_str)
            .ok_or_else(|| SignerError::BadSignature(result.to_string()))?;

        tracing::debug!(signature, "signature generated");
        Ok(format!("{base_url}?{query}&a_bogus={signature}"))
    }

    fn current_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn update_token(&self, token: String) {
        let mut slot = self.token.write();
        if slot.as_deref() != Some(token.as_str()) {
            tracing::info!("rolling token refreshed from response header");
            *slot = Some(token);
        }
    }
}

/// Serialize query pairs sorted by key, form-urlencoded.
fn canonical_query(pairs: &[(&str, &str)]) -> String {
    let mut sorted: Vec<(&str, &str)> = pairs.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in sorted {
        query.append_pair(key, value);
    }
    query.finish()
}

async fn navigate(
    cdp: &CdpClient,
    load_events: &mut watch::Receiver<u64>,
    url: &str,
) -> Result<(), SignerError> {
    let seen = *load_events.borrow();
    let result = cdp.call("Page.navigate", json!({ "url": url })).await?;
    if let Some(text) = result.get("errorText").and_then(Value::as_str) {
        if !text.is_empty() {
            return Err(SignerError::NavigationFailed(text.to_string()));
        }
    }
    let loaded = async {
        loop {
            if *load_events.borrow() > seen {
                break;
            }
            if load_events.changed().await.is_err() {
                break;
            }
        }
    };
    tokio::time::timeout(PAGE_LOAD_TIMEOUT, loaded)
        .await
        .map_err(|_| SignerError::PageLoadTimeout)?;
    Ok(())
}

async fn wait_for_entry_point(cdp: &CdpClient) -> Result<(), SignerError> {
    let deadline = tokio::time::Instant::now() + ENTRY_POINT_TIMEOUT;
    loop {
        match evaluate(cdp, ENTRY_POINT_PROBE).await {
            Ok(value) if value.as_bool() == Some(true) => return Ok(()),
            Ok(_) | Err(SignerError::JsException(_)) => {}
            Err(e) => return Err(e),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SignerError::EntryPointMissing);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_for_initial_token(token: &RwLock<Option<String>>) -> bool {
    let deadline = tokio::time::Instant::now() + TOKEN_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if token.read().is_some() {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    token.read().is_some()
}

/// Run an expression on the page and return its value.
async fn evaluate(cdp: &CdpClient, expression: &str) -> Result<Value, SignerError> {
    let result = cdp
        .call(
            "Runtime.evaluate",
            json!({
                "expression": expression,
                "returnByValue": true,
                "awaitPromise": true,
            }),
        )
        .await?;
    if let Some(details) = result.get("exceptionDetails") {
        let text = details
            .pointer("/exception/description")
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("unknown page exception");
        return Err(SignerError::JsException(text.to_string()));
    }
    Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
}

/// Routes browser notifications: load events feed the navigation waiter,
/// response headers feed the token cell, console output is forwarded.
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<CdpEvent>,
    load_events: watch::Sender<u64>,
    token: Arc<RwLock<Option<String>>>,
) {
    while let Some(event) = events.recv().await {
        match event.method.as_str() {
            "Page.loadEventFired" => {
                load_events.send_modify(|n| *n += 1);
            }
            "Network.responseReceived" | "Network.responseReceivedExtraInfo" => {
                if let Some(value) = response_token(&event.params) {
                    let mut slot = token.write();
                    if slot.as_deref() != Some(value) {
                        tracing::info!("captured rolling token from page traffic");
                        *slot = Some(value.to_string());
                    }
                }
            }
            "Runtime.consoleAPICalled" => forward_console(&event.params),
            _ => {}
        }
    }
}

/// Pull the rolling token out of a response event, wherever the headers
/// sit for that event kind. Header names are matched case-insensitively.
fn response_token(params: &Value) -> Option<&str> {
    let headers = params
        .pointer("/response/headers")
        .or_else(|| params.get("headers"))?
        .as_object()?;
    headers.iter().find_map(|(name, value)| {
        name.eq_ignore_ascii_case(TOKEN_HEADER)
            .then(|| value.as_str())
            .flatten()
    })
}

fn forward_console(params: &Value) {
    let kind = params.get("type").and_then(Value::as_str).unwrap_or("log");
    let text = params
        .get("args")
        .and_then(Value::as_array)
        .map(|args| {
            args.iter()
                .filter_map(console_arg_text)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    if console_noise(&text) {
        return;
    }
    match kind {
        "error" => tracing::error!(target: "browser", "{text}"),
        "warning" => tracing::warn!(target: "browser", "{text}"),
        _ => {}
    }
}

fn console_arg_text(arg: &Value) -> Option<String> {
    if let Some(value) = arg.get("value") {
        return Some(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    arg.get("description")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Messages the chat page emits constantly that carry no signal.
fn console_noise(text: &str) -> bool {
    const NOISE: &[&str] = &[
        "Failed to load resource",
        "net::ERR_FAILED",
        "WebSocket connection",
        "Content Security Policy",
        "Scripts may close only the windows that were opened by them",
        "Ignoring too frequent calls to print()",
    ];
    NOISE.iter().any(|marker| text.contains(marker))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
