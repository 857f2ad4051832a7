use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Seconds between watcher cycles.
pub const POLL_INTERVAL: u64 = 5;
/// Cycles between heartbeat log lines and opportunistic branch cleanup.
pub const HEARTBEAT_TICKS: u64 = 12;
/// Seconds to wait for the agent CLI to come up before pasting a prompt.
pub const AGENT_STARTUP_DELAY: u64 = 6;
/// Truncation width for comment previews in status output.
pub const COMMENT_TRUNCATE_LEN: usize = 80;
/// Agents run with permission prompts disabled.
pub const YOLO_MODE: bool = true;
/// Name of the tmux session everything lives in.
pub const SESSION_NAME: &str = "debussy";

/// Runtime state directory, shared with every agent worktree via symlink.
pub const STATE_DIR: &str = ".debussy";

fn config_file() -> PathBuf {
    Path::new(STATE_DIR).join("config.json")
}

/// Process-local configuration, persisted to `.debussy/config.json`.
///
/// Unknown keys in the file are dropped on the next save, which the watcher
/// forces at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paused: bool,
    #[serde(default = "default_max_total_agents")]
    pub max_total_agents: u32,
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout: u64,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default = "default_true")]
    pub use_tmux_windows: bool,
    #[serde(default = "default_agent_provider")]
    pub agent_provider: String,
    #[serde(default)]
    pub role_models: HashMap<String, String>,
}

fn default_max_total_agents() -> u32 {
    8
}
fn default_agent_timeout() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}
fn default_agent_provider() -> String {
    "claude".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paused: false,
            max_total_agents: default_max_total_agents(),
            agent_timeout: default_agent_timeout(),
            base_branch: None,
            use_tmux_windows: default_true(),
            agent_provider: default_agent_provider(),
            role_models: HashMap::new(),
        }
    }
}

impl Config {
    /// Load config from the default location, falling back to defaults on
    /// any read or parse failure.
    pub fn load() -> Self {
        Self::load_from(&config_file())
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config at {}: {e}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save atomically to the default location.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&config_file())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_string_pretty(self).context("serializing config")?;
        atomic_write(path, &data)
    }

    /// Load and immediately rewrite the config, dropping any keys this
    /// version does not know about.
    pub fn prune() -> anyhow::Result<Self> {
        let cfg = Self::load();
        cfg.save()?;
        Ok(cfg)
    }

    /// Set a key from its string representation, as typed on the CLI.
    pub fn set_key(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "paused" => self.paused = parse_bool(key, value)?,
            "max_total_agents" => {
                self.max_total_agents = value
                    .parse()
                    .map_err(|_| ExitError::Config(format!("{key} expects an integer")))?;
            }
            "agent_timeout" => {
                self.agent_timeout = value
                    .parse()
                    .map_err(|_| ExitError::Config(format!("{key} expects an integer")))?;
            }
            "base_branch" => self.base_branch = Some(value.to_string()),
            "use_tmux_windows" => self.use_tmux_windows = parse_bool(key, value)?,
            "agent_provider" => self.agent_provider = value.to_string(),
            "role_models" => {
                self.role_models = serde_json::from_str(value).map_err(|_| {
                    ExitError::Config(format!(
                        "{key} expects a JSON object, e.g. {{\"developer\": \"opus\"}}"
                    ))
                })?;
            }
            _ => return Err(ExitError::Config(format!("unknown config key: {key}")).into()),
        }
        Ok(())
    }

    /// String representation of a key, for `debussy config <key>`.
    pub fn get_key(&self, key: &str) -> Option<String> {
        match key {
            "paused" => Some(self.paused.to_string()),
            "max_total_agents" => Some(self.max_total_agents.to_string()),
            "agent_timeout" => Some(self.agent_timeout.to_string()),
            "base_branch" => Some(
                self.base_branch
                    .clone()
                    .unwrap_or_else(|| "not set".to_string()),
            ),
            "use_tmux_windows" => Some(self.use_tmux_windows.to_string()),
            "agent_provider" => Some(self.agent_provider.clone()),
            "role_models" => serde_json::to_string(&self.role_models).ok(),
            _ => None,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ExitError::Config(format!("{key} expects true/false")).into()),
    }
}

/// Write a file atomically: sibling temp file in the same directory, then
/// rename over the target.  A concurrent reader sees either the previous or
/// the next complete file.
pub fn atomic_write(path: &Path, data: &str) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("creating {}", parent.display()))?;
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .map_or_else(|| "config".to_string(), |n| n.to_string_lossy().into_owned())
    ));
    std::fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}

/// Timestamped, icon-prefixed progress line for the watcher and commands.
pub fn log(msg: &str, icon: &str) {
    let timestamp = chrono::Local::now().format("%H:%M:%S");
    println!("{timestamp} {icon} {msg}");
}
