use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::session::{RemoteChat, Role};

// ── Contract ──────────────────────────────────────────────────────────────────

/// Remote chat store. Every call is a suspension point; callers convert
/// failures into local no-ops.
#[async_trait]
pub trait PersistenceClient: Send + Sync {
    /// Allocate a new, empty session and return its id.
    async fn create_session(&self) -> Result<String>;
    /// Known session ids, in the service's order.
    async fn list_sessions(&self) -> Result<Vec<String>>;
    /// Full session detail, or `None` if the id is unknown.
    async fn get_session(&self, id: &str) -> Result<Option<RemoteChat>>;
    async fn delete_session(&self, id: &str) -> Result<()>;
    async fn append_message(&self, id: &str, role: Role, content: &str) -> Result<()>;
    async fn bind_container(&self, id: &str, container_id: &str) -> Result<()>;
}

// ── HTTP implementation ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreatedChat {
    chat_id: String,
}

pub struct HttpPersistence {
    http: reqwest::Client,
    base_url: String,
}

impl HttpPersistence {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build persistence HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

/// Turn a non-2xx response into an error carrying the body text.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    Err(anyhow!("persistence error {status}: {text}"))
}

#[async_trait]
impl PersistenceClient for HttpPersistence {
    async fn create_session(&self) -> Result<String> {
        let resp = self.http.post(self.url("/history/chat")).send().await?;
        let created: CreatedChat = check(resp)
            .await?
            .json()
            .await
            .context("Unexpected create-session response")?;
        Ok(created.chat_id)
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let resp = self.http.get(self.url("/history/chats")).send().await?;
        check(resp)
            .await?
            .json()
            .await
            .context("Unexpected session list response")
    }

    async fn get_session(&self, id: &str) -> Result<Option<RemoteChat>> {
        let resp = self
            .http
            .get(self.url(&format!("/history/chat/{id}")))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let chat = check(resp)
            .await?
            .json()
            .await
            .with_context(|| format!("Unexpected detail response for session {id}"))?;
        Ok(Some(chat))
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/history/chat/{id}")))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn append_message(&self, id: &str, role: Role, content: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/history/chat/{id}/message")))
            .json(&serde_json::json!({
                "user": role.as_wire(),
                "message": content,
            }))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn bind_container(&self, id: &str, container_id: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/history/chat/{id}/container")))
            .json(&serde_json::json!({ "container_id": container_id }))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}
