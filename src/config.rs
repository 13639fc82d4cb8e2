use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::commands::{CommandAction, CommandDefinition};
use crate::history::{DEFAULT_HISTORY_KEY, DEFAULT_MAX_CONVERSATIONS};
use crate::mobile::{MobileOptions, ResolvedMobileConfig};

pub const DEFAULT_ASK_AI_LABEL: &str = "Ask AI";
pub const DEFAULT_PLACEHOLDER: &str = "Type a command or search...";

// ── Command entries ───────────────────────────────────────────────────────────

/// A command declared in the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    pub label: Option<String>,
    pub group: Option<String>,
    pub icon: Option<String>,
    pub shortcut: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    /// Shell command run (via `sh -c`) when the entry is selected
    pub run: Option<String>,
}

impl CommandSpec {
    pub fn to_definition(&self) -> CommandDefinition {
        let mut def = CommandDefinition {
            name: self.name.clone(),
            label: self.label.clone(),
            group: self.group.clone(),
            icon: self.icon.clone(),
            shortcut: self.shortcut.clone(),
            keywords: self.keywords.clone(),
            disabled: self.disabled,
            on_select: None,
        };
        if let Some(run) = self.run.clone() {
            def = def.on_select(move || run_shell(&run));
        }
        def
    }
}

/// Under a tokio runtime the command is spawned and reaped in the background,
/// so a long script never stalls the event loop; only a failure to spawn is
/// an error, a non-zero exit is logged. Without a runtime we wait for it.
fn run_shell(script: &str) -> Result<()> {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        let status = shell(script)
            .status()
            .with_context(|| format!("spawning `{script}`"))?;
        if !status.success() {
            anyhow::bail!("`{script}` exited with {status}");
        }
        return Ok(());
    };

    let mut child = tokio::process::Command::from(shell(script))
        .spawn()
        .with_context(|| format!("spawning `{script}`"))?;
    let script = script.to_string();
    handle.spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => tracing::debug!(script, "command finished"),
            Ok(status) => tracing::warn!(script, "command exited with {status}"),
            Err(e) => tracing::warn!(script, "waiting for command failed: {e}"),
        }
    });
    Ok(())
}

fn shell(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

/// An agentic action: selecting it opens a new chat seeded with its label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    pub label: Option<String>,
}

// ── Profile ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Chat endpoint speaking the UI-message stream. Unset = chat disabled.
    pub chat_endpoint: Option<String>,
    /// Optional API key (sent as Bearer token)
    pub api_key: Option<String>,
    /// Storage key the conversation history lives under
    #[serde(default = "default_history_storage_key")]
    pub history_storage_key: String,
    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,
    #[serde(default = "default_ask_ai_label")]
    pub ask_ai_label: String,
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
    /// Heading of the agentic actions group
    pub actions_heading: Option<String>,
    /// Append host-callback failures to ~/.local/share/cmdk/errors.jsonl
    #[serde(default)]
    pub error_log: bool,
    #[serde(default)]
    pub mobile: MobileOptions,
    #[serde(default)]
    pub commands: Vec<CommandSpec>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

fn default_history_storage_key() -> String {
    DEFAULT_HISTORY_KEY.to_string()
}

fn default_max_conversations() -> usize {
    DEFAULT_MAX_CONVERSATIONS
}

fn default_ask_ai_label() -> String {
    DEFAULT_ASK_AI_LABEL.to_string()
}

fn default_placeholder() -> String {
    DEFAULT_PLACEHOLDER.to_string()
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            chat_endpoint: None,
            api_key: None,
            history_storage_key: default_history_storage_key(),
            max_conversations: default_max_conversations(),
            ask_ai_label: default_ask_ai_label(),
            placeholder: default_placeholder(),
            actions_heading: None,
            error_log: false,
            mobile: MobileOptions::default(),
            commands: Vec::new(),
            actions: Vec::new(),
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
        write_default_to(&path)?;
        Ok(path)
    }

    /// Resolve the active profile given an optional override name.
    pub fn resolve_profile(&self, name: Option<&str>) -> Option<&Profile> {
        let key = name.unwrap_or(&self.default_profile);
        self.profiles.get(key)
    }

    /// Profile names, sorted, for `--profiles`.
    pub fn profile_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn write_default_to(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("Failed to write config file at {}", path.display()))?;
    Ok(())
}

// ── Resolved runtime config (after merging file + CLI overrides) ──────────────

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub chat_endpoint: Option<String>,
    pub api_key: Option<String>,
    /// Profile name that was resolved (for display)
    pub profile_name: String,
    pub history_storage_key: String,
    pub max_conversations: usize,
    pub ask_ai_label: String,
    pub placeholder: String,
    pub actions_heading: String,
    pub error_log: bool,
    pub mobile: ResolvedMobileConfig,
    pub commands: Vec<CommandSpec>,
    pub actions: Vec<ActionSpec>,
}

impl ResolvedConfig {
    /// Merge config file profile with CLI overrides.
    /// Priority: CLI args > env vars (handled by clap) > config file profile > built-in defaults
    pub fn resolve(
        file: &ConfigFile,
        profile_override: Option<&str>,
        endpoint_override: Option<&str>,
        api_key_override: Option<&str>,
    ) -> Self {
        let profile_name = profile_override
            .unwrap_or(&file.default_profile)
            .to_string();

        let base = file
            .resolve_profile(profile_override)
            .cloned()
            .unwrap_or_default();

        Self {
            chat_endpoint: endpoint_override
                .map(str::to_string)
                .or(base.chat_endpoint)
                .filter(|e| !e.trim().is_empty()),
            api_key: api_key_override
                .map(str::to_string)
                .or(base.api_key),
            profile_name,
            history_storage_key: base.history_storage_key,
            max_conversations: base.max_conversations,
            ask_ai_label: base.ask_ai_label,
            placeholder: base.placeholder,
            actions_heading: base
                .actions_heading
                .unwrap_or_else(|| crate::commands::DEFAULT_ACTIONS_HEADING.to_string()),
            error_log: base.error_log,
            mobile: base.mobile.resolve(),
            commands: base.commands,
            actions: base.actions,
        }
    }

    pub fn command_definitions(&self) -> Vec<CommandDefinition> {
        self.commands.iter().map(CommandSpec::to_definition).collect()
    }

    pub fn command_actions(&self) -> Vec<CommandAction> {
        self.actions
            .iter()
            .map(|a| CommandAction {
                name: a.name.clone(),
                label: a.label.clone(),
                executable: true,
            })
            .collect()
    }
}

// ── Paths ─────────────────────────────────────────────────────────────────────

pub fn config_path() -> PathBuf {
    dirs_config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cmdk")
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

const DEFAULT_CONFIG_TOML: &str = r#"# cmdk configuration
# Run `cmdk --init` to regenerate this file.

default_profile = "local"

# ── Local chat endpoint (default) ────────────────────────────────────────────
[profiles.local]
chat_endpoint      = "http://localhost:3000/api/chat"
history_storage_key = "cmdk-chat-history"
max_conversations  = 50
ask_ai_label       = "Ask AI"
placeholder        = "Type a command or search..."
# error_log = true             # append callback failures to ~/.local/share/cmdk/errors.jsonl

[[profiles.local.commands]]
name     = "open-config"
label    = "Open config directory"
group    = "General"
keywords = ["settings", "preferences"]
run      = "xdg-open ~/.config/cmdk"

[[profiles.local.commands]]
name     = "git-status"
label    = "Git status"
group    = "Git"
shortcut = "g s"
run      = "git status"

# ── Agentic actions (selecting one starts a chat with its label) ─────────────
# [[profiles.local.actions]]
# name  = "summarize"
# label = "Summarize the last commit"

# ── Mobile sheet (touch terminals, narrow windows) ───────────────────────────
# [profiles.local.mobile]
# enabled             = true
# breakpoint          = 900    # px; terminal cells are scaled 8 px wide
# layout              = "keyboard-last"
# show_quick_actions  = true
# quick_actions_count = 4
# gesture = false              # or a table:
# [profiles.local.mobile.gesture]
# hold_ms     = 350
# swipe_up_px = 56

# ── Commands only, chat disabled ─────────────────────────────────────────────
# [profiles.offline]
# [[profiles.offline.commands]]
# name = "reload"
# run  = "true"

# ── Hosted endpoint with a key ───────────────────────────────────────────────
# [profiles.hosted]
# chat_endpoint = "https://example.com/api/chat"
# api_key       = "sk-..."
"#;
