/// Chat sessions as the client sees them.
///
/// A session is one transcript owned by the persistence service. Locally it
/// carries an ordered message list, a display title and an optional sandbox
/// container binding. Messages are immutable once appended; `sequence` is the
/// only ordering key and strictly increases within a session.
use serde::{Deserialize, Serialize};

/// Title shown until the first assistant reply arrives.
pub const UNTITLED: &str = "New chat";

/// Number of characters kept when deriving a title from a user message.
const TITLE_CHARS: usize = 20;
const ELLIPSIS: &str = "...";

// ── Role ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
    /// Local-only status line (e.g. the apology after a failed completion).
    /// Never persisted, never sent to the model.
    Notice,
}

impl Role {
    /// Role string used by the persistence service.
    pub fn as_wire(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Notice => "notice",
        }
    }

    /// Parse a persisted role. The legacy web client wrote "bot" for replies.
    pub fn from_wire(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" | "bot" => Some(Role::Assistant),
            _ => None,
        }
    }
}

// ── Message ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub sequence: u64,
}

/// One `{role, content}` pair, as sent to the inference endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryTurn {
    pub role: &'static str,
    pub content: String,
}

// ── Remote shapes ─────────────────────────────────────────────────────────────

/// A message as stored by the persistence service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub user: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Full session detail returned by `GET /history/chat/{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteChat {
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub messages: Vec<RemoteMessage>,
    #[serde(default)]
    pub container_id: Option<String>,
}

impl RemoteChat {
    /// Content of the first user-authored message, if any.
    pub fn first_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| Role::from_wire(&m.user) == Some(Role::User))
            .map(|m| m.message.as_str())
    }
}

// ── ChatSession ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    /// Opaque id assigned by the persistence service
    pub id: String,
    pub title: String,
    /// Always ordered by `sequence`, no duplicates
    pub messages: Vec<Message>,
    pub container_id: Option<String>,
    /// Set once the title has been derived; it is never rewritten after that
    pub titled: bool,
}

impl ChatSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: UNTITLED.to_string(),
            messages: Vec::new(),
            container_id: None,
            titled: false,
        }
    }

    /// Build a session from its persisted detail. Sequences follow the
    /// service's order; unknown roles are dropped.
    pub fn from_remote(id: impl Into<String>, remote: RemoteChat) -> Self {
        let mut session = Self::new(id);
        session.container_id = remote.container_id.clone();

        for m in &remote.messages {
            match Role::from_wire(&m.user) {
                Some(role) => {
                    session.push(role, m.message.clone());
                }
                None => {
                    tracing::warn!(session = %session.id, role = %m.user, "skipping message with unknown role");
                }
            }
        }

        if session.messages.iter().any(|m| m.role == Role::Assistant) {
            if let Some(first) = remote.first_user_message() {
                session.title = derive_title(first);
                session.titled = true;
            }
        }
        session
    }

    pub fn next_sequence(&self) -> u64 {
        self.messages.last().map(|m| m.sequence + 1).unwrap_or(0)
    }

    /// Append a message with the next sequence number and return a copy of it.
    pub fn push(&mut self, role: Role, content: String) -> Message {
        let msg = Message {
            role,
            content,
            sequence: self.next_sequence(),
        };
        self.messages.push(msg.clone());
        msg
    }

    /// Derive the title from `prompt`, the user message that triggered the
    /// first assistant reply. Only the first call has any effect; returns the
    /// new title when it changed.
    pub fn derive_title_once(&mut self, prompt: &str) -> Option<&str> {
        if self.titled {
            return None;
        }
        self.title = derive_title(prompt);
        self.titled = true;
        Some(&self.title)
    }

    /// Model-facing history: user and assistant turns in sequence order.
    pub fn history(&self) -> Vec<HistoryTurn> {
        self.messages
            .iter()
            .filter(|m| m.role != Role::Notice)
            .map(|m| HistoryTurn {
                role: m.role.as_wire(),
                content: m.content.clone(),
            })
            .collect()
    }
}

// ── Titles ────────────────────────────────────────────────────────────────────

/// First 20 characters of `text`, with "..." appended when truncated.
pub fn derive_title(text: &str) -> String {
    let text = text.trim();
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(TITLE_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}{ELLIPSIS}")
    } else {
        head
    }
}
