mod client;
mod config;
mod console;
mod controller;
mod persistence;
mod sandbox;
mod session;
mod session_list;
mod shell;
mod store;
mod terminal;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use config::{ConfigFile, Overrides, ResolvedConfig};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "hermine",
    version,
    about = "Your copilot for Linux: chat with a local model, history kept by the daemon",
    long_about = None,
)]
struct Args {
    /// Ask a single question about the current directory and print the answer
    /// and its suggested command (no history, no session)
    #[arg(short, long)]
    prompt: Option<String>,

    /// With --prompt: run the suggested command here after printing it
    #[arg(short = 'x', long, requires = "prompt")]
    execute: bool,

    /// Profile to use from config file
    #[arg(long, env = "HERMINE_PROFILE")]
    profile: Option<String>,

    /// Override the history/sandbox daemon URL
    #[arg(long, env = "HERMINE_HISTORY_URL")]
    history_url: Option<String>,

    /// Override inference endpoint URL
    #[arg(long, env = "HERMINE_ENDPOINT")]
    endpoint: Option<String>,

    /// Override model name
    #[arg(short, long, env = "HERMINE_MODEL")]
    model: Option<String>,

    /// Override API key
    #[arg(long, env = "HERMINE_API_KEY")]
    api_key: Option<String>,

    /// Bind a sandbox container to each new chat
    #[arg(long)]
    sandbox: bool,

    /// Write a default config file to ~/.config/hermine/config.toml and exit
    #[arg(long)]
    init: bool,

    /// List available profiles and exit
    #[arg(long)]
    profiles: bool,

    /// Generate shell completions and print to stdout (bash, zsh, fish, elvish)
    #[arg(long, value_name = "SHELL")]
    completions: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    // ── --init ────────────────────────────────────────────────────────────────
    if args.init {
        let path = ConfigFile::write_default_if_missing()?;
        println!("Config written to: {}", path.display());
        println!("Edit it, then run: hermine");
        return Ok(());
    }

    // ── --completions ─────────────────────────────────────────────────────────
    if let Some(shell_name) = &args.completions {
        return generate_completions(shell_name);
    }

    let file = ConfigFile::load()?;

    // ── --profiles ────────────────────────────────────────────────────────────
    if args.profiles {
        print_profiles(&file);
        return Ok(());
    }

    let resolved = ResolvedConfig::resolve(
        &file,
        &Overrides {
            profile: args.profile.as_deref(),
            persistence_url: args.history_url.as_deref(),
            endpoint: args.endpoint.as_deref(),
            model: args.model.as_deref(),
            api_key: args.api_key.as_deref(),
            sandbox: args.sandbox,
        },
    );

    let inference = build_inference(&resolved)?;

    // ── Single-shot mode ──────────────────────────────────────────────────────
    if let Some(prompt) = args.prompt {
        return run_single_shot(&prompt, &inference, args.execute, resolved.timeout).await;
    }

    // ── Interactive console ───────────────────────────────────────────────────
    let persistence: Arc<dyn persistence::PersistenceClient> = Arc::new(
        persistence::HttpPersistence::new(resolved.persistence_url.clone(), resolved.timeout)?,
    );
    let daemon = Arc::new(sandbox::SandboxClient::new(
        resolved.persistence_url.clone(),
        resolved.timeout,
    )?);

    println!();
    println!("  ▲ hermine  {}  ·  {}", resolved.profile_name, resolved.model);
    println!("  !help for commands");
    println!();

    let (view_tx, view_rx) = mpsc::unbounded_channel();
    let controller = controller::ChatController::new(Arc::clone(&persistence)).with_view(view_tx);
    let console = console::Console::new(
        controller,
        console::ConsoleParts {
            persistence,
            inference: Arc::new(inference),
            containers: daemon.clone(),
            system: daemon,
            container_image: resolved.container_image.clone(),
            bind_on_start: resolved.sandbox,
        },
    );
    console.run(view_rx).await
}

/// Logs go to stderr; `HERMINE_LOG` takes an env-filter directive (default "warn").
fn init_logging() {
    let filter = EnvFilter::try_from_env("HERMINE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn build_inference(resolved: &ResolvedConfig) -> Result<client::Client> {
    let mut inference = client::Client::new(
        resolved.endpoint.clone(),
        resolved.model.clone(),
        resolved.timeout,
    )?;
    if let Some(key) = &resolved.api_key {
        inference.set_api_key(key.clone());
    }
    if let Some(system) = &resolved.system_prompt {
        inference.set_system_prompt(system.clone());
    }
    Ok(inference)
}

// ── Single-shot mode (plain stdout, no history) ───────────────────────────────

async fn run_single_shot(
    prompt: &str,
    inference: &client::Client,
    execute: bool,
    limit: std::time::Duration,
) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let history = [session::HistoryTurn {
        role: session::Role::User.as_wire(),
        content: shell::single_shot_prompt(prompt, &cwd).await,
    }];
    let reply = inference.chat(&history).await?;
    println!("{reply}");

    let Some(command) = shell::suggested_command(&reply) else {
        println!("No command was found in the response.");
        return Ok(());
    };
    println!("$ {command}");
    if execute {
        print!("{}", shell::run_local(&command, limit).await?);
    } else {
        println!("(run again with --execute to run it here)");
    }
    Ok(())
}

// ── Profiles listing ──────────────────────────────────────────────────────────

fn print_profiles(file: &ConfigFile) {
    let mut entries: Vec<(&String, &config::Profile)> = file.profiles.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    println!();
    println!("  Profiles");
    for (name, p) in &entries {
        let marker = if **name == file.default_profile { " ←" } else { "" };
        println!("  {name}{marker}");
        println!("    history   {}", p.persistence_url);
        println!("    endpoint  {}", p.endpoint);
        println!("    model     {}", p.model);
        println!();
    }
}

// ── Shell completions ─────────────────────────────────────────────────────────

fn generate_completions(shell_name: &str) -> Result<()> {
    use clap_complete::{Shell, generate};

    let shell: Shell = match shell_name.to_lowercase().as_str() {
        "bash"    => Shell::Bash,
        "zsh"     => Shell::Zsh,
        "fish"    => Shell::Fish,
        "elvish"  => Shell::Elvish,
        _ => {
            eprintln!("Unknown shell: {shell_name}");
            eprintln!("Supported: bash, zsh, fish, elvish");
            std::process::exit(1);
        }
    };

    let mut cmd = Args::command();
    generate(shell, &mut cmd, "hermine", &mut std::io::stdout());
    Ok(())
}
