/// The active-session state machine.
///
/// `ChatController` owns the session cache and the pointer to the active
/// session. Every mutation lands in the cache synchronously, before the
/// controller awaits the persistence service, so a later `load_session` of the
/// same id always sees the latest local state. The active session lives in the
/// cache itself; switching away from it therefore never loses a message.
///
/// Sending is split around the model call: `send_message` records the user
/// turn and hands back a `PendingCompletion`, which the caller runs without
/// borrowing the controller, and `apply_completion` folds the result back in.
/// The user may switch sessions in between; a completion for an inactive
/// session still updates its cache entry and is still persisted, but it is not
/// rendered.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::client::{Completion, InferenceClient};
use crate::persistence::PersistenceClient;
use crate::sandbox::ContainerApi;
use crate::session::{ChatSession, HistoryTurn, Message, Role};
use crate::store::SessionStore;

/// Shown locally when the model could not be reached.
pub const APOLOGY: &str = "Sorry, I couldn't reach the model. Please try again in a moment.";

// ── States and view notifications ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    NoActiveSession,
    SessionActive,
    /// The active session has at least one completion outstanding
    AwaitingCompletion,
}

/// What the presentation layer needs to redraw. Only emitted for the active
/// session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    SessionActivated { id: String, title: String, messages: Vec<Message> },
    MessageAppended { id: String, message: Message },
    Typing(bool),
    TitleChanged { id: String, title: String },
    SessionDeleted { id: String },
}

// ── PendingCompletion ─────────────────────────────────────────────────────────

/// A user turn waiting for its model reply.
#[derive(Debug, Clone)]
pub struct PendingCompletion {
    pub session_id: String,
    /// The user message that triggered this completion
    pub prompt: String,
    history: Vec<HistoryTurn>,
}

impl PendingCompletion {
    /// Ask the model. Holds no reference to the controller.
    pub async fn run(&self, inference: &dyn InferenceClient) -> Completion {
        inference.complete(&self.history).await
    }
}

// ── ChatController ────────────────────────────────────────────────────────────

pub struct ChatController {
    persistence: Arc<dyn PersistenceClient>,
    store: SessionStore,
    active: Option<String>,
    /// Outstanding completions per session id
    awaiting: HashMap<String, usize>,
    view: Option<UnboundedSender<ViewEvent>>,
}

impl ChatController {
    pub fn new(persistence: Arc<dyn PersistenceClient>) -> Self {
        Self {
            persistence,
            store: SessionStore::default(),
            active: None,
            awaiting: HashMap::new(),
            view: None,
        }
    }

    /// Route view notifications to `tx`.
    pub fn with_view(mut self, tx: UnboundedSender<ViewEvent>) -> Self {
        self.view = Some(tx);
        self
    }

    pub fn state(&self) -> ControllerState {
        match &self.active {
            None => ControllerState::NoActiveSession,
            Some(id) if self.awaiting.get(id).copied().unwrap_or(0) > 0 => {
                ControllerState::AwaitingCompletion
            }
            Some(_) => ControllerState::SessionActive,
        }
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active_session(&self) -> Option<&ChatSession> {
        self.active.as_deref().and_then(|id| self.store.get(id))
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn is_active(&self, id: &str) -> bool {
        self.active.as_deref() == Some(id)
    }

    fn emit(&self, event: ViewEvent) {
        if let Some(tx) = &self.view {
            // A closed receiver only means nobody is drawing any more
            let _ = tx.send(event);
        }
    }

    fn activate(&mut self, id: &str) {
        self.active = Some(id.to_string());
        if let Some(session) = self.store.get(id) {
            self.emit(ViewEvent::SessionActivated {
                id: session.id.clone(),
                title: session.title.clone(),
                messages: session.messages.clone(),
            });
        }
        let typing = self.state() == ControllerState::AwaitingCompletion;
        self.emit(ViewEvent::Typing(typing));
    }

    // ── Session lifecycle ─────────────────────────────────────────────────────

    /// Start a new empty session and make it active. Returns `None` if the
    /// service could not allocate an id; the previous session stays active.
    pub async fn create_session(&mut self) -> Option<String> {
        let id = match self.persistence.create_session().await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "could not create session");
                return None;
            }
        };
        info!(session = %id, "created session");
        self.store.put(id.clone(), ChatSession::new(id.clone()));
        self.activate(&id);
        Some(id)
    }

    /// Switch to `id`. Served from the cache when possible; otherwise fetched,
    /// and an unknown or unreachable session opens empty.
    pub async fn load_session(&mut self, id: &str) {
        if self.store.contains(id) {
            debug!(session = %id, "session cache hit");
            self.activate(id);
            return;
        }

        let session = match self.persistence.get_session(id).await {
            Ok(Some(remote)) => ChatSession::from_remote(id, remote),
            Ok(None) => {
                info!(session = %id, "session not found, opening empty");
                ChatSession::new(id)
            }
            Err(e) => {
                warn!(session = %id, error = %e, "could not fetch session, opening empty");
                ChatSession::new(id)
            }
        };
        // Another load of the same id may have populated it while we waited
        if !self.store.contains(id) {
            self.store.put(id, session);
        }
        self.activate(id);
    }

    /// Forget a session locally, then ask the service to delete it.
    pub async fn delete_session(&mut self, id: &str) {
        self.store.delete(id);
        self.awaiting.remove(id);
        if self.is_active(id) {
            self.active = None;
            self.emit(ViewEvent::SessionDeleted { id: id.to_string() });
        }
        if let Err(e) = self.persistence.delete_session(id).await {
            warn!(session = %id, error = %e, "remote delete failed");
        }
    }

    /// Drop the current conversation and start over in a new session.
    pub async fn clear(&mut self) -> Option<String> {
        self.create_session().await
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    /// Record a user turn in the active session and persist it. Blank input is
    /// ignored without touching the network. With no active session a new one
    /// is created first.
    pub async fn send_message(&mut self, text: &str) -> Option<PendingCompletion> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let id = match self.active.clone() {
            Some(id) => id,
            None => self.create_session().await?,
        };

        let session = self.store.get_mut(&id)?;
        let message = session.push(Role::User, text.to_string());
        let history = session.history();
        *self.awaiting.entry(id.clone()).or_default() += 1;

        self.emit(ViewEvent::MessageAppended { id: id.clone(), message });
        self.emit(ViewEvent::Typing(true));

        if let Err(e) = self.persistence.append_message(&id, Role::User, text).await {
            warn!(session = %id, error = %e, "could not persist user message");
        }

        Some(PendingCompletion {
            session_id: id,
            prompt: text.to_string(),
            history,
        })
    }

    /// Fold a completion result into its session.
    pub async fn apply_completion(&mut self, pending: PendingCompletion, completion: Completion) {
        let id = pending.session_id;

        if let Some(n) = self.awaiting.get_mut(&id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.awaiting.remove(&id);
            }
        }

        match completion {
            Completion::Reply(text) => {
                let active = self.is_active(&id);
                match self.store.get_mut(&id) {
                    Some(session) => {
                        let message = session.push(Role::Assistant, text.clone());
                        let title = session.derive_title_once(&pending.prompt).map(str::to_string);
                        if active {
                            self.emit(ViewEvent::MessageAppended { id: id.clone(), message });
                            if let Some(title) = title {
                                self.emit(ViewEvent::TitleChanged { id: id.clone(), title });
                            }
                        }
                    }
                    None => debug!(session = %id, "completion for a session deleted locally"),
                }
                // Lands remotely only if the service still has the session
                if let Err(e) = self.persistence.append_message(&id, Role::Assistant, &text).await {
                    warn!(session = %id, error = %e, "could not persist assistant reply");
                }
            }
            Completion::Failed(reason) => {
                warn!(session = %id, reason = %reason, "completion failed");
                let active = self.is_active(&id);
                if let Some(session) = self.store.get_mut(&id) {
                    let message = session.push(Role::Notice, APOLOGY.to_string());
                    if active {
                        self.emit(ViewEvent::MessageAppended { id: id.clone(), message });
                    }
                }
            }
        }

        if self.is_active(&id) && self.state() == ControllerState::SessionActive {
            self.emit(ViewEvent::Typing(false));
        }
    }

    /// Send and wait for the reply in one step.
    pub async fn send_and_complete(&mut self, text: &str, inference: &dyn InferenceClient) {
        let Some(pending) = self.send_message(text).await else {
            return;
        };
        let completion = pending.run(inference).await;
        self.apply_completion(pending, completion).await;
    }

    // ── Sandbox binding ───────────────────────────────────────────────────────

    /// Bind a container to the active session.
    pub async fn bind_container(&mut self, container_id: &str) {
        let Some(id) = self.active.clone() else {
            return;
        };
        if let Some(session) = self.store.get_mut(&id) {
            session.container_id = Some(container_id.to_string());
        }
        if let Err(e) = self.persistence.bind_container(&id, container_id).await {
            warn!(session = %id, error = %e, "could not persist container binding");
        }
    }

    /// Container bound to the active session, creating and binding one from
    /// `image` if there is none yet.
    pub async fn ensure_container(&mut self, api: &dyn ContainerApi, image: &str) -> Option<String> {
        let session = self.active_session()?;
        if let Some(existing) = &session.container_id {
            return Some(existing.clone());
        }
        match api.create(image).await {
            Ok(container_id) => {
                self.bind_container(&container_id).await;
                Some(container_id)
            }
            Err(e) => {
                warn!(image = %image, error = %e, "could not create container");
                None
            }
        }
    }
}
