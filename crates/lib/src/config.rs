//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.rebullos/config.json`) and environment.
//! Environment variables override the file; every field has a default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tail::{TailDelivery, TailOptions};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Telegram bot settings.
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Reinstall script, elevation and log location.
    #[serde(default)]
    pub reinstall: ReinstallConfig,

    /// Output and tailing limits.
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Telegram bot config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    /// Bot token from BotFather. Overridden by TG_TOKEN or TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// Telegram user id of the only operator allowed to use the bot. Overridden by ADMIN_ID env.
    pub admin_id: Option<i64>,
}

/// Reinstall script settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReinstallConfig {
    /// Script to run. Overridden by REINSTALL_PATH env. Resolved to an absolute path at startup.
    #[serde(default = "default_script_path")]
    pub script_path: PathBuf,
    /// Privilege-elevation program prepended to every command (default "sudo"). Empty to run the script directly.
    #[serde(default = "default_elevation")]
    pub elevation: String,
    /// Log written by the script; followed by /progress.
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    /// When set, a proposal older than this many seconds can no longer be approved.
    #[serde(default)]
    pub pending_ttl_secs: Option<u64>,
}

fn default_script_path() -> PathBuf {
    PathBuf::from("./reinstall.sh")
}

fn default_elevation() -> String {
    "sudo".to_string()
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/reinstall.log")
}

impl Default for ReinstallConfig {
    fn default() -> Self {
        Self {
            script_path: default_script_path(),
            elevation: default_elevation(),
            log_path: default_log_path(),
            pending_ttl_secs: None,
        }
    }
}

/// Line caps, message size and tail timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsConfig {
    /// Lines of command output forwarded to the chat (default 40).
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    /// Characters per message (default 4000, Telegram's limit is 4096).
    #[serde(default = "default_max_line_chars")]
    pub max_line_chars: usize,
    /// How long /progress follows the log (default 600).
    #[serde(default = "default_tail_timeout_secs")]
    pub tail_timeout_secs: u64,
    /// Existing lines sent when /progress starts (default 50).
    #[serde(default = "default_tail_seed_lines")]
    pub tail_seed_lines: usize,
    /// Seconds between SIGTERM and SIGKILL for the follower (default 5).
    #[serde(default = "default_tail_grace_secs")]
    pub tail_grace_secs: u64,
    /// "perLine" (default) sends one message per log line; "batched" joins lines that arrive together.
    #[serde(default)]
    pub tail_delivery: TailDelivery,
}

fn default_max_lines() -> usize {
    crate::exec::DEFAULT_MAX_LINES
}

fn default_max_line_chars() -> usize {
    crate::exec::DEFAULT_MAX_LINE_CHARS
}

fn default_tail_timeout_secs() -> u64 {
    crate::tail::DEFAULT_TAIL_TIMEOUT.as_secs()
}

fn default_tail_seed_lines() -> usize {
    crate::tail::DEFAULT_TAIL_SEED_LINES
}

fn default_tail_grace_secs() -> u64 {
    crate::tail::DEFAULT_TAIL_GRACE.as_secs()
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
            max_line_chars: default_max_line_chars(),
            tail_timeout_secs: default_tail_timeout_secs(),
            tail_seed_lines: default_tail_seed_lines(),
            tail_grace_secs: default_tail_grace_secs(),
            tail_delivery: TailDelivery::default(),
        }
    }
}

impl LimitsConfig {
    /// Tail supervisor options derived from these limits.
    pub fn tail_options(&self) -> TailOptions {
        TailOptions {
            timeout: Duration::from_secs(self.tail_timeout_secs),
            grace: Duration::from_secs(self.tail_grace_secs),
            seed_lines: self.tail_seed_lines,
            max_line_chars: self.max_line_chars,
            delivery: self.tail_delivery,
            ..TailOptions::default()
        }
    }
}

/// Read a trimmed, non-empty env var.
fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the Telegram bot token: env TG_TOKEN, then TELEGRAM_BOT_TOKEN, override config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    env_nonempty("TG_TOKEN")
        .or_else(|| env_nonempty("TELEGRAM_BOT_TOKEN"))
        .or_else(|| {
            config
                .telegram
                .bot_token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the admin user id: env ADMIN_ID overrides config. Zero counts as unset.
pub fn resolve_admin_id(config: &Config) -> Result<Option<i64>> {
    let id = match env_nonempty("ADMIN_ID") {
        Some(s) => Some(
            s.parse::<i64>()
                .with_context(|| format!("ADMIN_ID is not a Telegram user id: {}", s))?,
        ),
        None => config.telegram.admin_id,
    };
    Ok(id.filter(|id| *id != 0))
}

/// Resolve the script path: env REINSTALL_PATH overrides config; the result is absolute.
/// Symlinks are resolved when the file exists; a missing script is reported at execution time.
pub fn resolve_script_path(config: &Config) -> Result<PathBuf> {
    let raw = env_nonempty("REINSTALL_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| config.reinstall.script_path.clone());
    absolutize(&raw)
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(p) => Ok(p),
        Err(_) => std::path::absolute(path)
            .with_context(|| format!("resolving script path {}", path.display())),
    }
}

/// Resolve the pending-command TTL (None = proposals never expire).
pub fn resolve_pending_ttl(config: &Config) -> Option<Duration> {
    config.reinstall.pending_ttl_secs.map(Duration::from_secs)
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("REBULLOS_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".rebullos").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path (or REBULLOS_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
