//! Thin wrapper over the `bd` issue-tracker CLI.
//!
//! This is the only module that shells out to `bd`.  Every call uses a short
//! timeout and degrades to `None`/empty on failure — tracker hiccups must
//! never take the watcher down.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::stage;
use crate::subprocess::Tool;

const SHOW_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Tracker-side status of a bead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
    /// Statuses the pipeline does not manage (e.g. the conductor's
    /// `planning`) are carried opaquely.
    #[serde(other)]
    #[default]
    Unknown,
}

impl BeadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BeadStatus::Open => "open",
            BeadStatus::InProgress => "in_progress",
            BeadStatus::Blocked => "blocked",
            BeadStatus::Closed => "closed",
            BeadStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A work item as returned by `bd … --json`.
#[derive(Debug, Clone, Deserialize)]
pub struct Bead {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: BeadStatus,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub dependency_count: u32,
    #[serde(default)]
    pub issue_type: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dependency {
    #[serde(default, alias = "depends_on_id")]
    pub id: String,
    #[serde(default)]
    pub status: Option<BeadStatus>,
}

impl Bead {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn stage_labels(&self) -> Vec<String> {
        stage::stage_labels(&self.labels)
    }

    /// Bugs sort to the front of every scan.
    pub fn is_bug(&self) -> bool {
        self.issue_type.as_deref() == Some("bug")
    }
}

/// Typed access to the tracker.
#[derive(Debug, Default)]
pub struct BeadClient;

impl BeadClient {
    pub fn new() -> Self {
        Self
    }

    /// Fetch one bead.  `bd show` returns a single-element array in recent
    /// versions and a bare object in older ones; both are accepted.
    pub fn get(&self, id: &str) -> Option<Bead> {
        let output = Tool::new("bd")
            .args(&["show", id, "--json"])
            .timeout(SHOW_TIMEOUT)
            .run()
            .ok()?;
        if !output.success() {
            tracing::warn!("bd show {id} failed: {}", output.stderr.trim());
            return None;
        }
        let value: serde_json::Value = output.parse_json().ok()?;
        let value = match value {
            serde_json::Value::Array(mut items) if !items.is_empty() => items.remove(0),
            serde_json::Value::Array(_) => return None,
            other => other,
        };
        serde_json::from_value(value).ok()
    }

    pub fn status(&self, id: &str) -> Option<BeadStatus> {
        self.get(id).map(|b| b.status)
    }

    /// List beads by status, optionally filtered by label.
    pub fn list(&self, status: BeadStatus, label: Option<&str>) -> Vec<Bead> {
        let mut args = vec!["list", "--status", status.as_str()];
        if let Some(label) = label {
            args.push("--label");
            args.push(label);
        }
        args.push("--json");
        self.run_list(&args)
    }

    /// Union of all beads across every pipeline status, deduplicated by id.
    pub fn list_all(&self) -> Vec<Bead> {
        let mut seen = std::collections::HashSet::new();
        let mut beads = Vec::new();
        for status in [
            BeadStatus::Open,
            BeadStatus::InProgress,
            BeadStatus::Closed,
            BeadStatus::Blocked,
        ] {
            let args = ["list", "--status", status.as_str(), "--limit", "0", "--json"];
            for bead in self.run_list(&args) {
                if seen.insert(bead.id.clone()) {
                    beads.push(bead);
                }
            }
        }
        beads
    }

    /// All children of a parent bead, regardless of status.
    pub fn children(&self, parent_id: &str) -> Vec<Bead> {
        self.run_list(&[
            "list", "--parent", parent_id, "--all", "--limit", "0", "--json",
        ])
    }

    /// Open beads with no parent (auto-close candidates).
    pub fn open_roots(&self) -> Vec<Bead> {
        self.run_list(&["list", "--status", "open", "--no-parent", "--json"])
    }

    fn run_list(&self, args: &[&str]) -> Vec<Bead> {
        let output = match Tool::new("bd").args(args).timeout(LIST_TIMEOUT).run() {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!("bd list failed: {e:#}");
                return Vec::new();
            }
        };
        if !output.success() || output.stdout.trim().is_empty() {
            return Vec::new();
        }
        output.parse_json().unwrap_or_default()
    }

    /// Apply a status/label mutation.  Returns true when the tracker
    /// accepted it (or there was nothing to do).
    pub fn update(
        &self,
        id: &str,
        status: Option<BeadStatus>,
        add_labels: &[String],
        remove_labels: &[String],
    ) -> bool {
        if status.is_none() && add_labels.is_empty() && remove_labels.is_empty() {
            return true;
        }
        let mut tool = Tool::new("bd").args(&["update", id]);
        if let Some(status) = status {
            tool = tool.args(&["--status", status.as_str()]);
        }
        for label in remove_labels {
            tool = tool.args(&["--remove-label", label]);
        }
        for label in add_labels {
            tool = tool.args(&["--add-label", label]);
        }
        match tool.timeout(SHOW_TIMEOUT).run() {
            Ok(output) if output.success() => true,
            Ok(output) => {
                tracing::warn!("bd update {id} failed: {}", output.stderr.trim());
                false
            }
            Err(e) => {
                tracing::warn!("bd update {id} error: {e:#}");
                false
            }
        }
    }

    /// Best-effort comment.
    pub fn comment(&self, id: &str, text: &str) {
        let _ = Tool::new("bd")
            .args(&["comment", id, text])
            .timeout(SHOW_TIMEOUT)
            .run();
    }

    /// Dependencies whose status is not `closed`.  Uses the status embedded
    /// in the dependency record when present, falling back to a lookup.
    pub fn unresolved_deps(&self, bead: &Bead) -> Vec<String> {
        let mut unresolved = Vec::new();
        for dep in &bead.dependencies {
            if dep.id.is_empty() {
                continue;
            }
            let status = dep.status.or_else(|| self.status(&dep.id));
            if status != Some(BeadStatus::Closed) {
                unresolved.push(dep.id.clone());
            }
        }
        unresolved
    }
}
