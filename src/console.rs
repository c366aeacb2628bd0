/// Line-oriented console front end.
///
/// Architecture:
///   main task:        select loop over stdin lines, finished completions
///                     and controller view events
///   completion tasks: tokio::spawn, one per sent message; results come back
///                     over an UnboundedSender and are applied on the main task
///
/// The controller is only ever touched from the main task, so switching
/// sessions while a reply is in flight is safe.
use std::sync::Arc;

use anyhow::Result;
use crossterm::style::Stylize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use crate::client::{Completion, InferenceClient};
use crate::controller::{ChatController, PendingCompletion, ViewEvent};
use crate::persistence::PersistenceClient;
use crate::sandbox::{ContainerApi, SystemApi};
use crate::session::{Message, Role};
use crate::session_list::{SessionEntry, SessionListLoader};
use crate::shell::{latest_suggestion, suggested_command};
use crate::terminal::{TerminalSignal, TerminalSignalRelay};

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Version,
    Exit,
    New,
    Clear,
    List,
    Load(String),
    Delete(String),
    Terminal(TerminalSignal),
    Run(String),
    Try,
    Apply,
    Send(String),
    Unknown(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('!') else {
            return Command::Send(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match (name.to_lowercase().as_str(), arg) {
            ("help", _) => Command::Help,
            ("version", _) => Command::Version,
            ("exit" | "quit", _) => Command::Exit,
            ("new", _) => Command::New,
            ("clear", _) => Command::Clear,
            ("list", _) => Command::List,
            ("load", a) if !a.is_empty() => Command::Load(a.to_string()),
            ("delete", a) if !a.is_empty() => Command::Delete(a.to_string()),
            ("run", a) if !a.is_empty() => Command::Run(a.to_string()),
            ("try", _) => Command::Try,
            ("apply", _) => Command::Apply,
            ("terminal", a) => match TerminalSignal::parse(a) {
                Some(signal) => Command::Terminal(signal),
                None => Command::Unknown(line.to_string()),
            },
            _ => Command::Unknown(line.to_string()),
        }
    }
}

const HELP: &str = "\
Available commands:
    !new             Start a new chat
    !clear           Forget this conversation and start a new chat
    !list            List saved chats
    !load <n|id>     Switch to a chat (number from !list, or its id)
    !delete <n|id>   Delete a chat
    !try             Try the suggested command in this chat's sandbox container
    !apply           Apply the suggested command to your system
    !run <command>   Run a command in this chat's sandbox container
    !terminal <open|close|play|pause|stop|restart>
    !version         Show the version
    !exit, !quit     Exit
Anything else is sent to the model.";

/// Every chat starts on the history service, so nothing can be sent without it.
const SERVICE_DOWN: &str = "History service unreachable; chats cannot be started until it is back.";

// ── Console ───────────────────────────────────────────────────────────────────

pub struct Console {
    controller: ChatController,
    persistence: Arc<dyn PersistenceClient>,
    inference: Arc<dyn InferenceClient>,
    containers: Arc<dyn ContainerApi>,
    system: Arc<dyn SystemApi>,
    container_image: String,
    bind_on_start: bool,
    relay: TerminalSignalRelay,
    /// Entries from the last `!list`, for numeric selection
    listed: Vec<SessionEntry>,
    /// First code block of the active chat's latest reply
    suggestion: Option<String>,
}

pub struct ConsoleParts {
    pub persistence: Arc<dyn PersistenceClient>,
    pub inference: Arc<dyn InferenceClient>,
    pub containers: Arc<dyn ContainerApi>,
    pub system: Arc<dyn SystemApi>,
    pub container_image: String,
    pub bind_on_start: bool,
}

enum Flow {
    Continue,
    Exit,
}

impl Console {
    pub fn new(controller: ChatController, parts: ConsoleParts) -> Self {
        Self {
            controller,
            persistence: parts.persistence,
            inference: parts.inference,
            containers: parts.containers,
            system: parts.system,
            container_image: parts.container_image,
            bind_on_start: parts.bind_on_start,
            relay: TerminalSignalRelay::default(),
            listed: Vec::new(),
            suggestion: None,
        }
    }

    pub async fn run(mut self, mut view_rx: mpsc::UnboundedReceiver<ViewEvent>) -> Result<()> {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(PendingCompletion, Completion)>();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        self.start_session().await;
        self.drain_view(&mut view_rx);
        prompt();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if let Flow::Exit = self.handle(Command::parse(&line), &done_tx).await {
                        break;
                    }
                    self.drain_view(&mut view_rx);
                    prompt();
                }
                Some((pending, completion)) = done_rx.recv() => {
                    self.controller.apply_completion(pending, completion).await;
                    self.drain_view(&mut view_rx);
                }
            }
        }

        println!("{}", "\nGoodbye!".bold().green());
        Ok(())
    }

    async fn start_session(&mut self) {
        let started = self.controller.create_session().await;
        self.finish_start(started).await;
    }

    /// Shared tail of `!new` and `!clear`: report an unreachable service, or
    /// bind a container to the fresh chat when configured to.
    async fn finish_start(&mut self, started: Option<String>) {
        if started.is_none() {
            println!("{}", SERVICE_DOWN.red());
            return;
        }
        if self.bind_on_start {
            let image = self.container_image.clone();
            self.controller.ensure_container(self.containers.as_ref(), &image).await;
        }
    }

    async fn handle(
        &mut self,
        command: Command,
        done_tx: &mpsc::UnboundedSender<(PendingCompletion, Completion)>,
    ) -> Flow {
        match command {
            Command::Empty => {}
            Command::Exit => return Flow::Exit,
            Command::Help => println!("{HELP}"),
            Command::Version => println!("{}", env!("CARGO_PKG_VERSION")),
            Command::New => self.start_session().await,
            Command::Clear => {
                let started = self.controller.clear().await;
                self.finish_start(started).await;
            }
            Command::List => {
                self.listed = SessionListLoader::new(self.persistence.as_ref()).load().await;
                print_list(&self.listed, &self.controller);
            }
            Command::Load(which) => {
                let id = self.resolve(&which);
                self.controller.load_session(&id).await;
            }
            Command::Delete(which) => {
                let id = self.resolve(&which);
                self.controller.delete_session(&id).await;
                self.listed.retain(|e| e.id != id);
                println!("{}", format!("Deleted {id}").dim());
            }
            Command::Terminal(signal) => {
                self.relay.relay(signal);
                let visibility = if self.relay.is_visible() { "visible" } else { "hidden" };
                println!("{}", format!("terminal {visibility}  {}", self.relay.status()).yellow());
            }
            Command::Run(cmd) => self.run_in_sandbox(&cmd).await,
            Command::Try => match self.suggestion.clone() {
                Some(cmd) => self.run_in_sandbox(&cmd).await,
                None => println!("{}", "No suggested command to try.".bold().red()),
            },
            Command::Apply => match self.suggestion.clone() {
                Some(cmd) => self.apply_on_system(&cmd).await,
                None => println!("{}", "No suggested command to apply.".bold().red()),
            },
            Command::Unknown(line) => {
                println!("{}", format!("Unknown command: {line}. Type !help for help.").bold().red());
            }
            Command::Send(text) => {
                if let Some(pending) = self.controller.send_message(&text).await {
                    let inference = Arc::clone(&self.inference);
                    let tx = done_tx.clone();
                    tokio::spawn(async move {
                        let completion = pending.run(inference.as_ref()).await;
                        let _ = tx.send((pending, completion));
                    });
                } else if self.controller.active_id().is_none() {
                    println!("{}", "No chat is open and a new one could not be created.".red());
                }
            }
        }
        Flow::Continue
    }

    /// A list number (1-based, from the last `!list`) or a raw id.
    fn resolve(&self, which: &str) -> String {
        which
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| self.listed.get(i))
            .map(|e| e.id.clone())
            .unwrap_or_else(|| which.to_string())
    }

    async fn run_in_sandbox(&mut self, cmd: &str) {
        let image = self.container_image.clone();
        let Some(container) = self.controller.ensure_container(self.containers.as_ref(), &image).await else {
            println!("{}", "No sandbox container available.".red());
            return;
        };
        match self.containers.start(&container).await {
            Ok(true) => {}
            Ok(false) => {
                println!("{}", "Error: failed to start container".red());
                return;
            }
            Err(e) => {
                warn!(container = %container, error = %e, "container start failed");
                println!("{}", format!("Error: {e}").red());
                return;
            }
        }
        println!("{}", format!("@container:{container}\n$ {cmd}").yellow());
        match self.containers.execute(&container, cmd).await {
            Ok(output) => println!("{}", output.green()),
            Err(e) => println!("{}", format!("Error: {e}").red()),
        }
    }

    async fn apply_on_system(&self, cmd: &str) {
        println!("{}", format!("$ {cmd}").yellow());
        match self.system.execute(cmd).await {
            Ok(output) => println!("{}", output.green()),
            Err(e) => {
                warn!(error = %e, "system execute failed");
                println!("{}", format!("Error: {e}").red());
            }
        }
    }

    /// Render pending view events, tracking the active chat's suggestion.
    fn drain_view(&mut self, rx: &mut mpsc::UnboundedReceiver<ViewEvent>) {
        while let Ok(event) = rx.try_recv() {
            match &event {
                ViewEvent::SessionActivated { messages, .. } => {
                    self.suggestion = latest_suggestion(messages);
                }
                ViewEvent::MessageAppended { message, .. } if message.role == Role::Assistant => {
                    self.suggestion = suggested_command(&message.content);
                }
                ViewEvent::SessionDeleted { .. } => self.suggestion = None,
                _ => {}
            }
            render(&event);
        }
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────────

fn prompt() {
    use std::io::Write;
    print!("{}", ">>> ".bold().blue());
    let _ = std::io::stdout().flush();
}

fn render(event: &ViewEvent) {
    match event {
        ViewEvent::SessionActivated { id, title, messages } => {
            println!("{}", format!("── {title}  ({id})").bold());
            for m in messages {
                render_message(m);
            }
        }
        // The user's own line is already on screen
        ViewEvent::MessageAppended { message, .. } if message.role == Role::User => {}
        ViewEvent::MessageAppended { message, .. } => {
            println!();
            render_message(message);
            prompt();
        }
        ViewEvent::Typing(true) => println!("{}", "Thinking...".green().dim()),
        ViewEvent::Typing(false) => {}
        ViewEvent::TitleChanged { title, .. } => println!("{}", format!("── {title}").dim()),
        ViewEvent::SessionDeleted { id } => {
            println!("{}", format!("Chat {id} closed. Use !new or !load.").dim());
        }
    }
}

fn render_message(m: &Message) {
    match m.role {
        Role::User => println!("{} {}", ">>>".blue(), m.content),
        Role::Assistant => println!("{}", m.content.as_str().white()),
        Role::Notice => println!("{}", m.content.as_str().red()),
    }
}

fn print_list(entries: &[SessionEntry], controller: &ChatController) {
    if entries.is_empty() {
        println!("{}", "No saved chats.".dim());
        return;
    }
    for (i, entry) in entries.iter().enumerate() {
        let marker = if controller.active_id() == Some(entry.id.as_str()) {
            " ←"
        } else if controller.store().contains(&entry.id) {
            " ·"
        } else {
            ""
        };
        let when = entry
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("  {:>2}. {}{marker}  {}", i + 1, entry.title, when.dim());
    }
}
