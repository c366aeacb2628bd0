use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;

use crate::session::HistoryTurn;

// ── Completion result ─────────────────────────────────────────────────────────

/// Outcome of one completion request. Failure is an ordinary branch, not an
/// error: the controller turns it into a local notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Reply(String),
    Failed(String),
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn complete(&self, history: &[HistoryTurn]) -> Completion;
}

// ── SSE delta types for accumulation ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
    /// Thinking tokens some local models (Qwen3, DeepSeek-R1) send separately.
    /// Not part of the reply.
    reasoning_content: Option<String>,
}

// ── Client ────────────────────────────────────────────────────────────────────

/// OpenAI-compatible chat endpoint (Ollama serves one at `/v1/chat/completions`).
pub struct Client {
    http: reqwest::Client,
    pub endpoint: String,
    pub model: String,
    api_key: Option<String>,
    system_prompt: Option<String>,
}

impl Client {
    pub fn new(endpoint: String, model: String, timeout: Duration) -> Result<Self> {
        // Idle limits only: a long reply that keeps streaming is never cut off
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .context("Failed to build inference HTTP client")?;
        Ok(Self {
            http,
            endpoint,
            model,
            api_key: None,
            system_prompt: None,
        })
    }

    pub fn set_api_key(&mut self, key: String) {
        self.api_key = Some(key);
    }

    pub fn set_system_prompt(&mut self, prompt: String) {
        self.system_prompt = Some(prompt);
    }

    /// Stream a chat completion and return the accumulated reply text.
    pub async fn chat(&self, history: &[HistoryTurn]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "stream": true,
            "messages": build_messages(self.system_prompt.as_deref(), history),
        });

        let url = format!("{}/v1/chat/completions", self.endpoint.trim_end_matches('/'));

        let mut req = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);

        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("API error {}: {}", status, text));
        }

        let mut stream = resp.bytes_stream();
        let mut text_buf = String::new();
        let mut pending: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            pending.extend_from_slice(&chunk?);
            accumulate_sse(&mut pending, &mut text_buf);
        }

        // Last line may arrive without its newline
        if !pending.is_empty() {
            pending.push(b'\n');
            accumulate_sse(&mut pending, &mut text_buf);
        }

        if text_buf.trim().is_empty() {
            return Err(anyhow!("model returned an empty or malformed response"));
        }
        Ok(text_buf)
    }
}

#[async_trait]
impl InferenceClient for Client {
    async fn complete(&self, history: &[HistoryTurn]) -> Completion {
        match self.chat(history).await {
            Ok(text) => Completion::Reply(text),
            Err(e) => {
                tracing::warn!(model = %self.model, error = %e, "completion failed");
                Completion::Failed(e.to_string())
            }
        }
    }
}

/// Consume every complete line in `buf`, appending reply text to `out`.
/// Bytes after the last newline stay in `buf` until the next network chunk,
/// so a line (or a multi-byte character) split across chunks is decoded whole.
fn accumulate_sse(buf: &mut Vec<u8>, out: &mut String) {
    while let Some(end) = buf.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buf.drain(..=end).collect();
        accumulate_line(&String::from_utf8_lossy(&line), out);
    }
}

fn accumulate_line(line: &str, out: &mut String) {
    let line = line.trim();
    if line.is_empty() || line == "data: [DONE]" {
        return;
    }
    let Some(json_str) = line.strip_prefix("data: ") else {
        return;
    };

    let chunk: StreamChunk = match serde_json::from_str(json_str) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "skipping unparseable SSE line");
            return;
        }
    };

    for choice in chunk.choices.unwrap_or_default() {
        let Some(delta) = choice.delta else { continue };
        if delta.reasoning_content.is_some() && delta.content.as_deref().unwrap_or("").is_empty() {
            continue;
        }
        if let Some(text) = delta.content {
            out.push_str(&text);
        }
    }
}

// ── Build the messages array for the API ──────────────────────────────────────

fn build_messages(system: Option<&str>, history: &[HistoryTurn]) -> Vec<Value> {
    let mut out = Vec::new();

    if let Some(system) = system.filter(|s| !s.is_empty()) {
        out.push(serde_json::json!({
            "role": "system",
            "content": system
        }));
    }

    for turn in history {
        out.push(serde_json::json!({
            "role": turn.role,
            "content": turn.content
        }));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_support::serve_chunked;
    use std::time::Instant;

    fn delta_line(text: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{text}\"}}}}]}}\n\n")
    }

    fn user_turn(text: &str) -> Vec<HistoryTurn> {
        vec![HistoryTurn { role: "user", content: text.into() }]
    }

    #[test]
    fn test_accumulate_sse_joins_deltas() {
        let mut buf = format!("{}{}data: [DONE]\n", delta_line("Hel"), delta_line("lo")).into_bytes();
        let mut out = String::new();
        accumulate_sse(&mut buf, &mut out);
        assert_eq!(out, "Hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_accumulate_sse_keeps_split_line() {
        let line = delta_line("ok").into_bytes();
        let (head, tail) = line.split_at(20);
        let mut buf = head.to_vec();
        let mut out = String::new();
        accumulate_sse(&mut buf, &mut out);
        assert!(out.is_empty());
        assert_eq!(buf, head);

        buf.extend_from_slice(tail);
        accumulate_sse(&mut buf, &mut out);
        assert_eq!(out, "ok");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_accumulate_sse_keeps_split_character() {
        let line = delta_line("Exécuter").into_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut buf = line[..split].to_vec();
        let mut out = String::new();
        accumulate_sse(&mut buf, &mut out);
        assert!(out.is_empty());

        buf.extend_from_slice(&line[split..]);
        accumulate_sse(&mut buf, &mut out);
        assert_eq!(out, "Exécuter");
    }

    #[test]
    fn test_accumulate_sse_skips_reasoning() {
        let mut buf = "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"hmm\"}}]}\n\
                       data: {\"choices\":[{\"delta\":{\"content\":\"answer\"}}]}\n"
            .as_bytes()
            .to_vec();
        let mut out = String::new();
        accumulate_sse(&mut buf, &mut out);
        assert_eq!(out, "answer");
    }

    #[tokio::test]
    async fn test_reply_survives_character_split_across_chunks() {
        let body = format!("{}data: [DONE]\n\n", delta_line("Exécuter")).into_bytes();
        let split = body.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let endpoint = serve_chunked(vec![
            (Duration::ZERO, body[..split].to_vec()),
            (Duration::from_millis(50), body[split..].to_vec()),
        ])
        .await;

        let client = Client::new(endpoint, "hermine".to_string(), Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.complete(&user_turn("Que fait ls ?")).await,
            Completion::Reply("Exécuter".into())
        );
    }

    #[tokio::test]
    async fn test_steady_stream_outlives_timeout() {
        let parts = ["one ", "two ", "three ", "four"]
            .iter()
            .map(|t| (Duration::from_millis(600), delta_line(t).into_bytes()))
            .collect();
        let endpoint = serve_chunked(parts).await;

        let client = Client::new(endpoint, "hermine".to_string(), Duration::from_secs(1)).unwrap();
        let started = Instant::now();
        let completion = client.complete(&user_turn("count")).await;
        assert!(started.elapsed() > Duration::from_secs(2));
        assert_eq!(completion, Completion::Reply("one two three four".into()));
    }

    #[tokio::test]
    async fn test_stalled_stream_is_failed_completion() {
        let endpoint = serve_chunked(vec![
            (Duration::ZERO, delta_line("partial").into_bytes()),
            (Duration::from_millis(1500), delta_line(" late").into_bytes()),
        ])
        .await;

        let client = Client::new(endpoint, "hermine".to_string(), Duration::from_millis(500)).unwrap();
        assert!(matches!(client.complete(&user_turn("hi")).await, Completion::Failed(_)));
    }

    #[test]
    fn test_build_messages_with_system_prompt() {
        let history = vec![
            HistoryTurn { role: "user", content: "hi".into() },
            HistoryTurn { role: "assistant", content: "hello".into() },
        ];
        let msgs = build_messages(Some("be brief"), &history);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[2]["content"], "hello");

        assert_eq!(build_messages(Some(""), &history).len(), 2);
        assert_eq!(build_messages(None, &history).len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_failed_completion() {
        // Port 9 (discard) on localhost is expected to refuse connections
        let client = Client::new(
            "http://127.0.0.1:9".to_string(),
            "hermine".to_string(),
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(matches!(client.complete(&user_turn("hi")).await, Completion::Failed(_)));
    }
}
