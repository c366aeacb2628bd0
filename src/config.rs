use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Profile ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Base URL of the history/sandbox daemon
    #[serde(default = "default_persistence_url")]
    pub persistence_url: String,
    /// OpenAI-compatible inference endpoint URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Model identifier
    #[serde(default = "default_model")]
    pub model: String,
    /// Optional API key (sent as Bearer token)
    pub api_key: Option<String>,
    /// Optional system prompt prepended to every completion request
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Seconds: idle limit on inference streams, request deadline for the daemon
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Image used when a session needs a sandbox container
    #[serde(default = "default_container_image")]
    pub container_image: String,
    /// Create and bind a sandbox container for each session. Default: false.
    #[serde(default)]
    pub sandbox: bool,
}

fn default_persistence_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "hermine".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_container_image() -> String {
    "debian".to_string()
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            persistence_url: default_persistence_url(),
            endpoint: default_endpoint(),
            model: default_model(),
            api_key: None,
            system_prompt: None,
            timeout_secs: default_timeout_secs(),
            container_image: default_container_image(),
            sandbox: false,
        }
    }
}

// ── Config file ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    /// Which profile to use when none is specified
    #[serde(default = "default_profile_name")]
    pub default_profile: String,

    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

fn default_profile_name() -> String {
    "default".to_string()
}

impl ConfigFile {
    /// Load from disk, or return a default config if the file doesn't exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))
    }

    /// Write a starter config file to disk (only if it doesn't exist).
    pub fn write_default_if_missing() -> Result<PathBuf> {
        let path = config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, DEFAULT_CONFIG_TOML)?;
        Ok(path)
    }

    /// Resolve the active profile given an optional override name.
    pub fn resolve_profile(&self, name: Option<&str>) -> Option<&Profile> {
        let key = name.unwrap_or(&self.default_profile);
        self.profiles.get(key)
    }
}

// ── Resolved runtime config (after merging file + CLI overrides) ──────────────

/// Values given on the command line (or via env vars, handled by clap).
#[derive(Debug, Clone, Default)]
pub struct Overrides<'a> {
    pub profile: Option<&'a str>,
    pub persistence_url: Option<&'a str>,
    pub endpoint: Option<&'a str>,
    pub model: Option<&'a str>,
    pub api_key: Option<&'a str>,
    pub sandbox: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub persistence_url: String,
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    pub timeout: Duration,
    pub container_image: String,
    pub sandbox: bool,
    /// Profile name that was resolved (for display)
    pub profile_name: String,
}

impl ResolvedConfig {
    /// Priority: CLI args > env vars (handled by clap) > config file profile > built-in defaults
    pub fn resolve(file: &ConfigFile, overrides: &Overrides<'_>) -> Self {
        let profile_name = overrides
            .profile
            .unwrap_or(&file.default_profile)
            .to_string();

        let base = file
            .resolve_profile(overrides.profile)
            .cloned()
            .unwrap_or_default();

        Self {
            persistence_url: overrides
                .persistence_url
                .map(str::to_string)
                .unwrap_or(base.persistence_url),
            endpoint: overrides
                .endpoint
                .map(str::to_string)
                .unwrap_or(base.endpoint),
            model: overrides
                .model
                .map(str::to_string)
                .unwrap_or(base.model),
            api_key: overrides
                .api_key
                .map(str::to_string)
                .or(base.api_key),
            system_prompt: base.system_prompt,
            timeout: Duration::from_secs(base.timeout_secs),
            container_image: base.container_image,
            sandbox: overrides.sandbox || base.sandbox,
            profile_name,
        }
    }
}

// ── Paths ─────────────────────────────────────────────────────────────────────

pub fn config_path() -> PathBuf {
    dirs_config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hermine")
        .join("config.toml")
}

fn dirs_config_dir() -> Option<PathBuf> {
    // XDG_CONFIG_HOME or ~/.config on Linux/macOS
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })
}

// ── Default config template written on first run ──────────────────────────────

const DEFAULT_CONFIG_TOML: &str = r#"# Hermine configuration
# Run `hermine --init` to regenerate this file.

default_profile = "local"

# ── Local daemon + Ollama (default) ──────────────────────────────────────────
[profiles.local]
persistence_url = "http://localhost:5000"
endpoint        = "http://localhost:11434"
model           = "hermine"
timeout_secs    = 60
# api_key is not needed for Ollama

# ── Sandbox containers (optional, per-profile) ───────────────────────────────
# sandbox         = true        # bind a container to each session at start
# container_image = "debian"

# ── Remote OpenAI-compatible endpoint ─────────────────────────────────────────
# [profiles.remote]
# persistence_url = "http://localhost:5000"
# endpoint        = "https://api.openai.com"
# model           = "gpt-4o-mini"
# api_key         = "sk-..."
# system_prompt   = "You are a helpful Linux assistant."
"#;
