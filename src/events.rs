//! Append-only pipeline event log.
//!
//! One JSON object per line under `.debussy/pipeline_events.jsonl`.  Writes
//! are best-effort: losing a trailing event is acceptable, crashing the
//! watcher over a full disk is not.  The metrics command and the
//! completeness audit both fold this log.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::STATE_DIR;
use crate::stage::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Spawn,
    Advance,
    Reject,
    Close,
    Block,
    Unblock,
    Release,
    Timeout,
    EmptyBranch,
    EmptyBranchBlocked,
    LoopBlocked,
    PrematureClose,
    UnverifiedMerge,
    BlockedFailures,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: f64,
    pub bead: String,
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "from")]
    pub from_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejections: Option<u32>,
}

impl Event {
    pub fn new(bead: &str, kind: EventKind) -> Self {
        Self {
            ts: now_epoch(),
            bead: bead.to_string(),
            event: kind,
            stage: None,
            from_stage: None,
            to: None,
            agent: None,
            retry: None,
            retries: None,
            rejections: None,
        }
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage.label());
        self
    }

    pub fn from_to(mut self, from: Stage, to: &str) -> Self {
        self.from_stage = Some(from.label());
        self.to = Some(to.to_string());
        self
    }

    pub fn agent(mut self, name: &str) -> Self {
        self.agent = Some(name.to_string());
        self
    }

    pub fn retry(mut self, n: u32) -> Self {
        self.retry = Some(n);
        self
    }

    pub fn retries(mut self, n: u32) -> Self {
        self.retries = Some(n);
        self
    }

    pub fn rejections(mut self, n: u32) -> Self {
        self.rejections = Some(n);
        self
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl Default for EventLog {
    fn default() -> Self {
        Self {
            path: Path::new(STATE_DIR).join("pipeline_events.jsonl"),
        }
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append one event.  I/O failures are swallowed.
    pub fn record(&self, event: Event) {
        let Ok(line) = serde_json::to_string(&event) else {
            return;
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            tracing::warn!("could not record pipeline event: {e}");
        }
    }

    /// Load every event, skipping lines that do not parse.
    pub fn load(&self) -> Vec<Event> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Events for one bead, in file order.
    pub fn for_bead(&self, bead_id: &str) -> Vec<Event> {
        self.load()
            .into_iter()
            .filter(|e| e.bead == bead_id)
            .collect()
    }
}
