/// Client for the command routes of the persistence daemon: sandbox
/// containers under `/sandbox/*` and the host shell at `/system/execute`.
///
/// Containers are opaque here: ids are created, handed to the session binding
/// and forwarded to lifecycle calls. Nothing in this crate interprets the
/// status the daemon reports.
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;

#[async_trait]
pub trait ContainerApi: Send + Sync {
    /// Create a container from `image` and return its id.
    async fn create(&self, image: &str) -> Result<String>;

    /// Start (or restart) the container. Returns whether it reports running.
    async fn start(&self, id: &str) -> Result<bool>;

    /// Run `command` in the container and return its combined output.
    async fn execute(&self, id: &str, command: &str) -> Result<String>;
}

/// Commands run on the machine the daemon lives on, outside any container.
#[async_trait]
pub trait SystemApi: Send + Sync {
    async fn execute(&self, command: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct Created {
    container_id: String,
}

#[derive(Debug, Deserialize)]
struct SystemOutput {
    #[serde(default)]
    output: String,
}

#[derive(Debug, Deserialize)]
struct DaemonError {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Success {
    #[serde(default)]
    success: bool,
}

pub struct SandboxClient {
    http: reqwest::Client,
    base_url: String,
}

impl SandboxClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build sandbox HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/sandbox{path}", self.base_url.trim_end_matches('/'))
    }

    fn system_url(&self, path: &str) -> String {
        format!("{}/system{path}", self.base_url.trim_end_matches('/'))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.http.get(self.url(path)).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("sandbox error {status}: {text}"));
        }
        resp.json().await.with_context(|| format!("Unexpected response from sandbox{path}"))
    }
}

/// Prefer the daemon's `{"error": ...}` message over the raw body.
fn error_message(text: &str) -> String {
    serde_json::from_str::<DaemonError>(text)
        .ok()
        .and_then(|e| e.error)
        .unwrap_or_else(|| text.to_string())
}

#[async_trait]
impl ContainerApi for SandboxClient {
    async fn create(&self, image: &str) -> Result<String> {
        let created: Created = self.get_json(&format!("/create/{image}")).await?;
        Ok(created.container_id)
    }

    async fn start(&self, id: &str) -> Result<bool> {
        let ok: Success = self.get_json(&format!("/start/{id}")).await?;
        Ok(ok.success)
    }

    async fn execute(&self, id: &str, command: &str) -> Result<String> {
        let resp = self
            .http
            .post(self.url(&format!("/execute/{id}")))
            .json(&serde_json::json!({ "command": command }))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(anyhow!("sandbox error {status}: {}", error_message(&text)));
        }
        Ok(text)
    }
}

#[async_trait]
impl SystemApi for SandboxClient {
    async fn execute(&self, command: &str) -> Result<String> {
        let resp = self
            .http
            .post(self.system_url("/execute"))
            .json(&serde_json::json!({ "command": command }))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(anyhow!("system error {status}: {}", error_message(&text)));
        }
        let out: SystemOutput =
            serde_json::from_str(&text).context("Unexpected response from system/execute")?;
        Ok(out.output)
    }
}
