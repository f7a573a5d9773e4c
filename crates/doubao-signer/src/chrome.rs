//! Managed Chrome process with remote debugging enabled.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::{Child, Command};

use crate::error::SignerError;

const CHROME_CANDIDATES: &[&str] = &[
    "google-chrome-stable",
    "google-chrome",
    "chromium-browser",
    "chromium",
    "chrome",
];

const DEVTOOLS_WAIT: Duration = Duration::from_secs(20);
const DEVTOOLS_POLL: Duration = Duration::from_millis(250);

pub struct ChromeProcess {
    child: Child,
    port: u16,
    // Held so the profile directory outlives the process.
    _profile: TempDir,
}

impl ChromeProcess {
    /// Launch Chrome with DevTools on `port` and wait until the endpoint
    /// answers. The process is killed when this value is dropped.
    pub async fn launch(port: u16, headless: bool) -> Result<Self, SignerError> {
        let binary = find_chrome_binary()?;
        let profile =
            TempDir::new().map_err(|e| SignerError::Launch(format!("profile dir: {e}")))?;

        let mut command = Command::new(&binary);
        command
            .arg(format!("--remote-debugging-port={port}"))
            .arg(format!("--user-data-dir={}", profile.path().display()))
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--disable-popup-blocking")
            .arg("--window-size=1280,900")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if headless {
            command.arg("--headless=new");
        }
        command.arg("about:blank");

        let mut child = command
            .spawn()
            .map_err(|e| SignerError::Launch(format!("{}: {e}", binary.display())))?;

        wait_for_devtools(&mut child, port).await?;

        tracing::info!(port, binary = %binary.display(), "chrome ready");
        Ok(Self {
            child,
            port,
            _profile: profile,
        })
    }

    /// WebSocket URL of the first page target.
    pub async fn page_ws_url(&self) -> Result<String, SignerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        let targets: Vec<serde_json::Value> = client
            .get(format!("http://127.0.0.1:{}/json", self.port))
            .send()
            .await?
            .json()
            .await?;
        targets
            .iter()
            .find(|target| target.get("type").and_then(|v| v.as_str()) == Some("page"))
            .and_then(|target| target.get("webSocketDebuggerUrl").and_then(|v| v.as_str()))
            .map(str::to_string)
            .ok_or_else(|| {
                SignerError::Launch("no page target exposes a webSocketDebuggerUrl".into())
            })
    }

    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!("chrome kill failed: {e}");
        }
    }
}

fn find_chrome_binary() -> Result<PathBuf, SignerError> {
    for name in CHROME_CANDIDATES {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }
    Err(SignerError::Launch(format!(
        "no chrome binary found (tried {})",
        CHROME_CANDIDATES.join(", ")
    )))
}

async fn wait_for_devtools(child: &mut Child, port: u16) -> Result<(), SignerError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    let url = format!("http://127.0.0.1:{port}/json/version");
    let deadline = tokio::time::Instant::now() + DEVTOOLS_WAIT;
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| SignerError::Launch(e.to_string()))?
        {
            return Err(SignerError::Launch(format!(
                "chrome exited during startup with {status}"
            )));
        }
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return Ok(());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(SignerError::Launch(format!(
                "devtools endpoint did not come up on port {port} within {DEVTOOLS_WAIT:?}"
            )));
        }
        tokio::time::sleep(DEVTOOLS_POLL).await;
    }
}
