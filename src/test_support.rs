//! In-memory fakes for the remote collaborators, plus a one-request HTTP
//! server for exercising the real clients.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::client::{Completion, InferenceClient};
use crate::persistence::PersistenceClient;
use crate::sandbox::{ContainerApi, SystemApi};
use crate::session::{HistoryTurn, RemoteChat, RemoteMessage, Role};

#[derive(Default)]
struct Inner {
    order: Vec<String>,
    chats: HashMap<String, RemoteChat>,
    next_id: usize,
    calls: Vec<String>,
    /// Per-id gates: `get_session` waits on these before answering
    gates: HashMap<String, oneshot::Receiver<()>>,
    /// Ids in the order their `get_session` calls completed
    finished: Vec<String>,
}

/// Persistence service kept in memory. Records every call it receives.
#[derive(Default)]
pub struct FakePersistence {
    inner: Mutex<Inner>,
    offline: Mutex<bool>,
}

impl FakePersistence {
    /// Pre-populate a session with `(role, content)` messages.
    pub fn seed(&self, id: &str, messages: &[(&str, &str)]) {
        let mut inner = self.inner.lock().unwrap();
        inner.order.push(id.to_string());
        inner.chats.insert(
            id.to_string(),
            RemoteChat {
                created_at: None,
                messages: messages
                    .iter()
                    .map(|(user, message)| RemoteMessage {
                        user: user.to_string(),
                        message: message.to_string(),
                        timestamp: None,
                    })
                    .collect(),
                container_id: None,
            },
        );
    }

    /// Make every call fail as if the service were unreachable.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock().unwrap() = offline;
    }

    /// Hold `get_session(id)` until the returned sender fires.
    pub fn gate(&self, id: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().gates.insert(id.to_string(), rx);
        tx
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.inner.lock().unwrap().calls.len()
    }

    pub fn finished(&self) -> Vec<String> {
        self.inner.lock().unwrap().finished.clone()
    }

    /// Persisted `(role, content)` pairs for a session.
    pub fn persisted(&self, id: &str) -> Vec<(String, String)> {
        self.inner
            .lock()
            .unwrap()
            .chats
            .get(id)
            .map(|c| c.messages.iter().map(|m| (m.user.clone(), m.message.clone())).collect())
            .unwrap_or_default()
    }

    pub fn container_of(&self, id: &str) -> Option<String> {
        self.inner.lock().unwrap().chats.get(id).and_then(|c| c.container_id.clone())
    }

    fn record(&self, call: String) -> Result<()> {
        self.inner.lock().unwrap().calls.push(call);
        if *self.offline.lock().unwrap() {
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceClient for FakePersistence {
    async fn create_session(&self) -> Result<String> {
        self.record("create".to_string())?;
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = format!("chat-{}", inner.next_id);
        inner.order.push(id.clone());
        inner.chats.insert(id.clone(), RemoteChat::default());
        Ok(id)
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        self.record("list".to_string())?;
        Ok(self.inner.lock().unwrap().order.clone())
    }

    async fn get_session(&self, id: &str) -> Result<Option<RemoteChat>> {
        self.record(format!("get {id}"))?;
        let gate = self.inner.lock().unwrap().gates.remove(id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.finished.push(id.to_string());
        Ok(inner.chats.get(id).cloned())
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        self.record(format!("delete {id}"))?;
        let mut inner = self.inner.lock().unwrap();
        inner.order.retain(|i| i != id);
        inner.chats.remove(id).map(|_| ()).ok_or_else(|| anyhow!("persistence error 404"))
    }

    async fn append_message(&self, id: &str, role: Role, content: &str) -> Result<()> {
        self.record(format!("append {id} {}", role.as_wire()))?;
        let mut inner = self.inner.lock().unwrap();
        let chat = inner.chats.get_mut(id).ok_or_else(|| anyhow!("persistence error 404"))?;
        chat.messages.push(RemoteMessage {
            user: role.as_wire().to_string(),
            message: content.to_string(),
            timestamp: None,
        });
        Ok(())
    }

    async fn bind_container(&self, id: &str, container_id: &str) -> Result<()> {
        self.record(format!("bind {id} {container_id}"))?;
        let mut inner = self.inner.lock().unwrap();
        let chat = inner.chats.get_mut(id).ok_or_else(|| anyhow!("persistence error 404"))?;
        chat.container_id = Some(container_id.to_string());
        Ok(())
    }
}

/// Inference endpoint that plays back a fixed script of completions.
#[derive(Default)]
pub struct ScriptedInference {
    script: Mutex<VecDeque<Completion>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<HistoryTurn>>>,
}

impl ScriptedInference {
    pub fn new(script: impl IntoIterator<Item = Completion>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Histories received, one per call.
    pub fn seen(&self) -> Vec<Vec<HistoryTurn>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn complete(&self, history: &[HistoryTurn]) -> Completion {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(history.to_vec());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Completion::Failed("script exhausted".to_string()))
    }
}

/// Container API that hands out sequential ids and records executions.
#[derive(Default)]
pub struct FakeContainers {
    created: AtomicUsize,
    executed: Mutex<Vec<(String, String)>>,
}

impl FakeContainers {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// `(container, command)` pairs in call order.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerApi for FakeContainers {
    async fn create(&self, image: &str) -> Result<String> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{image}-{n}"))
    }

    async fn start(&self, _id: &str) -> Result<bool> {
        Ok(true)
    }

    async fn execute(&self, id: &str, command: &str) -> Result<String> {
        self.executed.lock().unwrap().push((id.to_string(), command.to_string()));
        Ok(format!("ran {command}"))
    }
}

/// Host shell that records commands instead of running them.
#[derive(Default)]
pub struct FakeSystem {
    commands: Mutex<Vec<String>>,
}

impl FakeSystem {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl SystemApi for FakeSystem {
    async fn execute(&self, command: &str) -> Result<String> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(String::new())
    }
}

// ── One-request HTTP server ───────────────────────────────────────────────────

/// Answer one request with a chunked `text/event-stream` body, writing each
/// part as its own HTTP chunk after its delay. Returns the base URL.
pub async fn serve_chunked(parts: Vec<(Duration, Vec<u8>)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        read_request(&mut sock).await;
        // The client may hang up early; nothing left to do then
        let _ = write_chunked(&mut sock, parts).await;
    });
    format!("http://{addr}")
}

/// Answer one request with a JSON body. The receiver yields the raw request.
pub async fn serve_json(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let request = read_request(&mut sock).await;
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = sock.write_all(response.as_bytes()).await;
        let _ = sock.shutdown().await;
        let _ = tx.send(request);
    });
    (format!("http://{addr}"), rx)
}

async fn write_chunked(sock: &mut TcpStream, parts: Vec<(Duration, Vec<u8>)>) -> std::io::Result<()> {
    sock.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n",
    )
    .await?;
    for (delay, part) in parts {
        tokio::time::sleep(delay).await;
        sock.write_all(format!("{:x}\r\n", part.len()).as_bytes()).await?;
        sock.write_all(&part).await?;
        sock.write_all(b"\r\n").await?;
        sock.flush().await?;
    }
    sock.write_all(b"0\r\n\r\n").await?;
    sock.shutdown().await
}

/// Read headers and a Content-Length body so the socket closes cleanly.
async fn read_request(sock: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = sock.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        let Some(head_end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&data[..head_end]).to_lowercase();
        let body_len = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if data.len() >= head_end + 4 + body_len {
            break;
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}
