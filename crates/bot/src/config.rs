//! Bridge configuration.
//!
//! Loaded once at startup from environment variables, with dotenv support:
//! a local `./.env` is read first, then `<data_dir>/.env` (first-loaded
//! wins — dotenv never overrides variables that are already set).
//!
//! The per-content-type notification filter lives in `notify.json` next to
//! the other state files and is created with everything enabled on first run
//! so the user has a file to edit.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use ccbot_protocol::ContentType;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::paths;
use crate::store::write_json_atomic;

const DEFAULT_MUX_SESSION: &str = "ccbot";
const DEFAULT_AGENT_COMMAND: &str = "claude";
const DEFAULT_POLL_INTERVAL_SECS: f64 = 2.0;
const DEFAULT_STATUS_POLL_INTERVAL_SECS: f64 = 1.0;

fn default_true() -> bool {
    true
}

/// Per-content-type notification toggles, mirrored to `notify.json`.
///
/// Interactive prompts and tool-result in-place edits bypass the filter;
/// there is deliberately no key for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    #[serde(default = "default_true")]
    pub text: bool,
    #[serde(default = "default_true")]
    pub thinking: bool,
    #[serde(default = "default_true")]
    pub tool_use: bool,
    #[serde(default = "default_true")]
    pub tool_result: bool,
    #[serde(default = "default_true")]
    pub tool_error: bool,
    #[serde(default = "default_true")]
    pub local_command: bool,
    #[serde(default = "default_true")]
    pub user: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            text: true,
            thinking: true,
            tool_use: true,
            tool_result: true,
            tool_error: true,
            local_command: true,
            user: true,
        }
    }
}

impl NotifyConfig {
    /// Load from `path`, creating the file with defaults if absent.
    pub fn load_or_create(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NotifyConfig>(&data) {
                    Ok(cfg) => return cfg,
                    Err(e) => {
                        warn!(
                            component = "config",
                            event = "config.notify_parse_failed",
                            path = %path.display(),
                            error = %e,
                            "Failed to parse notify.json, using defaults"
                        );
                        return Self::default();
                    }
                },
                Err(e) => {
                    warn!(
                        component = "config",
                        event = "config.notify_read_failed",
                        path = %path.display(),
                        error = %e,
                        "Failed to read notify.json, using defaults"
                    );
                    return Self::default();
                }
            }
        }

        let defaults = Self::default();
        if let Err(e) = write_json_atomic(path, &defaults) {
            warn!(
                component = "config",
                event = "config.notify_create_failed",
                path = %path.display(),
                error = %e,
                "Failed to create default notify.json"
            );
        } else {
            info!(
                component = "config",
                event = "config.notify_created",
                path = %path.display(),
                "Created default notify.json"
            );
        }
        defaults
    }

    /// Whether a message of this content type should be delivered.
    ///
    /// Tool errors are governed by their own toggle, so an error inside a
    /// tool result still surfaces when `tool_result` is off. Interactive
    /// prompts always pass.
    pub fn should_notify(&self, content_type: ContentType) -> bool {
        match content_type {
            ContentType::Text => self.text,
            ContentType::Thinking => self.thinking,
            ContentType::ToolUse => self.tool_use,
            ContentType::ToolResult => self.tool_result,
            ContentType::ToolError => self.tool_error,
            ContentType::LocalCommand => self.local_command,
            ContentType::User => self.user,
            ContentType::InteractivePrompt => true,
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub allowed_users: HashSet<i64>,
    pub mux_session: String,
    pub agent_command: String,
    pub poll_interval: Duration,
    pub status_poll_interval: Duration,
    pub notify: NotifyConfig,
}

impl Config {
    /// Load configuration. Missing required values are fatal; the caller
    /// exits non-zero without partial startup.
    pub fn load() -> anyhow::Result<Self> {
        let local_env = Path::new(".env");
        if local_env.is_file() {
            let _ = dotenvy::from_path(local_env);
        }
        let global_env = paths::env_file_path();
        if global_env.is_file() {
            let _ = dotenvy::from_path(&global_env);
        }

        let bot_token =
            std::env::var("TELEGRAM_BOT_TOKEN").context("TELEGRAM_BOT_TOKEN is required")?;
        if bot_token.trim().is_empty() {
            bail!("TELEGRAM_BOT_TOKEN is required");
        }

        let allowed_raw = std::env::var("ALLOWED_USERS").context("ALLOWED_USERS is required")?;
        let allowed_users = parse_allowed_users(&allowed_raw)?;
        if allowed_users.is_empty() {
            bail!("ALLOWED_USERS must contain at least one numeric user id");
        }

        let mux_session = std::env::var("TMUX_SESSION_NAME")
            .unwrap_or_else(|_| DEFAULT_MUX_SESSION.to_string());
        let agent_command =
            std::env::var("CLAUDE_COMMAND").unwrap_or_else(|_| DEFAULT_AGENT_COMMAND.to_string());

        let poll_interval = parse_interval_env("MONITOR_POLL_INTERVAL", DEFAULT_POLL_INTERVAL_SECS)?;
        let status_poll_interval =
            parse_interval_env("STATUS_POLL_INTERVAL", DEFAULT_STATUS_POLL_INTERVAL_SECS)?;

        let notify = NotifyConfig::load_or_create(&paths::notify_path());

        info!(
            component = "config",
            event = "config.loaded",
            allowed_users = allowed_users.len(),
            mux_session = %mux_session,
            agent_command = %agent_command,
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Config initialized"
        );

        Ok(Self {
            bot_token,
            allowed_users,
            mux_session,
            agent_command,
            poll_interval,
            status_poll_interval,
            notify,
        })
    }

    pub fn is_user_allowed(&self, user_id: i64) -> bool {
        self.allowed_users.contains(&user_id)
    }
}

fn parse_allowed_users(raw: &str) -> anyhow::Result<HashSet<i64>> {
    let mut users = HashSet::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let id: i64 = part.parse().with_context(|| {
            format!("ALLOWED_USERS contains non-numeric value '{part}' (expected comma-separated ids)")
        })?;
        users.insert(id);
    }
    Ok(users)
}

fn parse_interval_env(name: &str, default_secs: f64) -> anyhow::Result<Duration> {
    let secs = match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<f64>()
            .with_context(|| format!("{name} must be a number of seconds"))?,
        Err(_) => default_secs,
    };
    if !secs.is_finite() || secs <= 0.0 {
        bail!("{name} must be a positive number of seconds");
    }
    Ok(Duration::from_secs_f64(secs))
}
