//! The watcher: a single-threaded supervisor that polls the tracker,
//! launches one agent per eligible bead, and runs the transition engine when
//! agents terminate.
//!
//! All concurrency is external (child processes or tmux windows); the loop
//! itself is the serialization point, so every transition for a bead happens
//! between cycles, never during one.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::beads::{BeadClient, BeadStatus};
use crate::config::{self, Config, HEARTBEAT_TICKS, POLL_INTERVAL, STATE_DIR, log};
use crate::error::ExitError;
use crate::events::{Event, EventKind, EventLog};
use crate::scanner;
use crate::stage::{Role, Stage};
use crate::subprocess::Tool;
use crate::tmux;
use crate::transitions::{Counters, Engine, GitProbe, MAX_RETRIES, epoch_secs};
use crate::worktree;

/// Background agents that exit sooner than this never did real work.
pub const MIN_AGENT_RUNTIME: u64 = 30;

const LOCK_STEAL_WAIT: Duration = Duration::from_secs(5);

/// Liveness handle for a spawned agent.
#[derive(Debug)]
pub enum AgentHandle {
    /// Agent lives in a tmux window named after the agent.
    Tmux,
    /// Detached child process running the provider CLI.
    Child(Child),
}

/// One live agent, from spawn to reap.
#[derive(Debug)]
pub struct AgentRecord {
    pub bead: String,
    pub role: Role,
    pub name: String,
    pub spawned_stage: Stage,
    pub started_at: u64,
    /// Empty for investigators, which run in the main checkout.
    pub worktree_path: String,
    pub log_path: String,
    /// Whether the bead was ever observed `in_progress` while this agent
    /// ran.  Distinguishes a tmux window that did work from one that died
    /// at startup.
    pub claimed_seen: bool,
    pub handle: AgentHandle,
}

impl AgentRecord {
    pub fn is_tmux(&self) -> bool {
        matches!(self.handle, AgentHandle::Tmux)
    }

    pub fn pid(&self) -> Option<u32> {
        match &self.handle {
            AgentHandle::Tmux => None,
            AgentHandle::Child(child) => Some(child.id()),
        }
    }

    pub fn is_alive(&mut self, windows: &HashSet<String>) -> bool {
        match &mut self.handle {
            AgentHandle::Tmux => windows.contains(&self.name),
            AgentHandle::Child(child) => matches!(child.try_wait(), Ok(None)),
        }
    }

    /// Kill the agent (tmux window or OS process).
    pub fn stop(&mut self) {
        match &mut self.handle {
            AgentHandle::Tmux => tmux::kill_window(&self.name),
            AgentHandle::Child(child) => {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }

    #[cfg(test)]
    pub fn for_tests(bead: &str, role: Role, spawned_stage: Stage) -> Self {
        Self {
            bead: bead.to_string(),
            role,
            name: format!("{role}-test"),
            spawned_stage,
            started_at: epoch_secs(),
            worktree_path: String::new(),
            log_path: String::new(),
            claimed_seen: false,
            handle: AgentHandle::Tmux,
        }
    }
}

/// Per-bead entry in `.debussy/watcher_state.json`, read back by the
/// status and board commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub agent: String,
    pub role: String,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub worktree: String,
    #[serde(default)]
    pub started_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub tmux: bool,
}

impl From<&AgentRecord> for StateEntry {
    fn from(agent: &AgentRecord) -> Self {
        Self {
            agent: agent.name.clone(),
            role: agent.role.name().to_string(),
            log: agent.log_path.clone(),
            worktree: agent.worktree_path.clone(),
            started_at: agent.started_at,
            pid: agent.pid(),
            tmux: agent.is_tmux(),
        }
    }
}

fn state_file() -> PathBuf {
    Path::new(STATE_DIR).join("watcher_state.json")
}

fn lock_path() -> PathBuf {
    Path::new(STATE_DIR).join("watcher.lock")
}

/// Read the live-agent map persisted by the watcher.
pub fn load_state() -> HashMap<String, StateEntry> {
    std::fs::read_to_string(state_file())
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// Windows named `<role>-…` belong to us; anything else is left alone.
pub fn is_agent_window(window_name: &str) -> bool {
    Role::ALL
        .iter()
        .any(|role| window_name.starts_with(&format!("{}-", role.name())))
}

pub struct Watcher {
    pub tracker: BeadClient,
    pub events: EventLog,
    pub probe: GitProbe,
    pub config: Config,
    pub counters: Counters,
    /// `role:bead` → live agent.
    pub running: HashMap<String, AgentRecord>,
    pub used_names: HashSet<String>,
    /// Window-name cache, refreshed once per cycle.
    pub windows: HashSet<String>,
    shutdown: Arc<AtomicBool>,
    tick: u64,
}

impl Watcher {
    pub fn new() -> Self {
        let config = Config::prune().unwrap_or_else(|e| {
            tracing::warn!("could not rewrite config: {e:#}");
            Config::load()
        });
        Self {
            tracker: BeadClient::new(),
            events: EventLog::new(),
            probe: GitProbe,
            config,
            counters: Counters::new(Path::new(STATE_DIR)),
            running: HashMap::new(),
            used_names: HashSet::new(),
            windows: HashSet::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            tick: 0,
        }
    }

    /// Run until a termination signal arrives.
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.ensure_origin()?;
        self.acquire_lock()?;

        let flag = self.shutdown.clone();
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .context("installing signal handler")?;

        worktree::cleanup_stale_worktrees();
        log(&format!("Watcher started (poll every {POLL_INTERVAL}s)"), "👀");

        while !self.shutdown.load(Ordering::SeqCst) {
            self.cycle();
            for _ in 0..POLL_INTERVAL * 2 {
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(500));
            }
        }

        self.stop_all_agents();
        self.release_lock();
        log("Watcher stopped", "•");
        Ok(())
    }

    fn cycle(&mut self) {
        // The pause/resume commands and the conductor edit config behind our
        // back; re-read it every cycle instead of caching.
        self.config = Config::load();

        self.refresh_windows();
        self.check_timeouts();
        self.cleanup_finished();
        self.kill_orphan_windows();
        scanner::reset_orphaned(self);
        if self.tick % 3 == 0 {
            scanner::auto_close_parents(self);
        }
        if !self.config.paused {
            scanner::release_ready(self);
            scanner::check_pipeline(self);
        }
        self.save_state();
        self.tick += 1;
        if self.tick % HEARTBEAT_TICKS == 0 {
            self.heartbeat();
        }
    }

    fn refresh_windows(&mut self) {
        // Listing even with no tracked tmux agents lets kill_orphan_windows
        // clean up agents left over from a previous watcher run.
        if tmux::in_tmux() || self.running.values().any(AgentRecord::is_tmux) {
            self.windows = tmux::list_windows();
        } else {
            self.windows.clear();
        }
    }

    /// Kill agents that outlived `agent_timeout` and reset their beads for
    /// retry.
    fn check_timeouts(&mut self) {
        let timeout = self.config.agent_timeout;
        let now = epoch_secs();
        let windows = self.windows.clone();
        let mut expired = Vec::new();
        for (key, agent) in self.running.iter_mut() {
            if agent.is_alive(&windows) && now.saturating_sub(agent.started_at) >= timeout {
                expired.push(key.clone());
            }
        }

        for key in expired {
            let Some(mut agent) = self.running.remove(&key) else {
                continue;
            };
            log(
                &format!("{} timed out on {} after {timeout}s", agent.name, agent.bead),
                "⏱️",
            );
            self.events.record(
                Event::new(&agent.bead, EventKind::Timeout)
                    .stage(agent.spawned_stage)
                    .agent(&agent.name),
            );
            self.tracker.comment(
                &agent.bead,
                &format!(
                    "Agent {} timed out after {timeout}s — resetting for retry",
                    agent.name
                ),
            );
            let _ = self
                .tracker
                .update(&agent.bead, Some(BeadStatus::Open), &[], &[]);
            agent.stop();
            self.teardown(&agent);
        }
    }

    /// Reap agents whose window or process is gone: run the transition
    /// engine for genuine completions, account crashes.
    fn cleanup_finished(&mut self) {
        let windows = self.windows.clone();
        let mut finished = Vec::new();
        for (key, agent) in self.running.iter_mut() {
            if !agent.is_alive(&windows) {
                finished.push(key.clone());
            }
        }

        let mut cleaned = false;
        for key in finished {
            let Some(mut agent) = self.running.remove(&key) else {
                continue;
            };
            if let AgentHandle::Child(child) = &mut agent.handle {
                let _ = child.wait();
            }
            self.reap(&agent);
            self.teardown(&agent);
            log(&format!("{} finished {}", agent.name, agent.bead), "🛑");
            cleaned = true;
        }
        if cleaned {
            self.save_state();
        }
    }

    fn reap(&mut self, agent: &AgentRecord) {
        let Some(bead) = self.tracker.get(&agent.bead) else {
            log(
                &format!("Could not read bead {} after agent exit", agent.bead),
                "⚠️",
            );
            return;
        };

        let in_progress = bead.status == BeadStatus::InProgress;
        let runtime = epoch_secs().saturating_sub(agent.started_at);
        let genuine = if agent.is_tmux() {
            agent.claimed_seen && !in_progress
        } else {
            runtime >= MIN_AGENT_RUNTIME && !in_progress
        };

        if genuine {
            let mut engine = Engine {
                tracker: &self.tracker,
                events: &self.events,
                probe: &self.probe,
                counters: &mut self.counters,
                base_branch: self
                    .config
                    .base_branch
                    .clone()
                    .unwrap_or_else(|| "master".to_string()),
            };
            if engine.ensure_stage_transition(agent) {
                self.counters.failures.remove(&agent.bead);
            }
        } else {
            let failures = *self
                .counters
                .failures
                .entry(agent.bead.clone())
                .and_modify(|c| *c += 1)
                .or_insert(1);
            log(
                &format!(
                    "{} crashed on {} ({failures}/{MAX_RETRIES})",
                    agent.name, agent.bead
                ),
                "💥",
            );
            if in_progress {
                // Free the claim so the next cycle can retry the bead.
                let _ = self
                    .tracker
                    .update(&agent.bead, Some(BeadStatus::Open), &[], &[]);
            }
        }
    }

    fn teardown(&mut self, agent: &AgentRecord) {
        if !agent.worktree_path.is_empty() {
            if let Err(e) = worktree::remove(&agent.name) {
                tracing::warn!("worktree teardown for {} failed: {e:#}", agent.name);
            }
        }
        self.used_names.remove(&agent.name);
    }

    /// Windows named like agents but belonging to no record survive watcher
    /// restarts; kill them so their names can be reused.
    fn kill_orphan_windows(&mut self) {
        let tracked: HashSet<String> = self.running.values().map(|a| a.name.clone()).collect();
        for window in self.windows.clone() {
            if is_agent_window(&window) && !tracked.contains(&window) {
                tmux::kill_window(&window);
                log(&format!("Killed orphan window {window}"), "🧹");
            }
        }
    }

    /// Persist the live-agent map for the status and board commands.
    pub fn save_state(&mut self) {
        let windows = self.windows.clone();
        let mut state: HashMap<String, StateEntry> = HashMap::new();
        for agent in self.running.values_mut() {
            if agent.is_alive(&windows) {
                state.insert(agent.bead.clone(), StateEntry::from(&*agent));
            }
        }
        if let Ok(data) = serde_json::to_string_pretty(&state) {
            if let Err(e) = config::atomic_write(&state_file(), &data) {
                tracing::warn!("could not persist watcher state: {e:#}");
            }
        }
    }

    fn heartbeat(&mut self) {
        let windows = self.windows.clone();
        let mut active = Vec::new();
        for agent in self.running.values_mut() {
            if agent.is_alive(&windows) {
                active.push((agent.name.clone(), agent.bead.clone()));
            }
        }
        if active.is_empty() {
            log("Idle", "💤");
        } else {
            log(&format!("Active ({}):", active.len()), "🔄");
            for (name, bead) in active {
                log(&format!("  {name} → {bead}"), "");
            }
        }
        worktree::cleanup_orphaned_branches();
        worktree::cleanup_stale_worktrees();
    }

    pub fn is_bead_running(&mut self, bead_id: &str) -> bool {
        let windows = &self.windows;
        self.running
            .values_mut()
            .any(|a| a.bead == bead_id && a.is_alive(windows))
    }

    pub fn has_running_role(&mut self, role: Role) -> bool {
        let windows = &self.windows;
        self.running
            .values_mut()
            .any(|a| a.role == role && a.is_alive(windows))
    }

    pub fn total_running(&mut self) -> usize {
        let windows = &self.windows;
        self.running
            .values_mut()
            .map(|a| a.is_alive(windows))
            .filter(|alive| *alive)
            .count()
    }

    pub fn at_capacity(&mut self) -> bool {
        self.total_running() >= self.config.max_total_agents as usize
    }

    fn stop_all_agents(&mut self) {
        if self.running.is_empty() {
            return;
        }
        log("Stopping agents...", "🛑");
        for agent in self.running.values_mut() {
            agent.stop();
        }
        self.running.clear();
        self.save_state();
    }

    fn ensure_origin(&self) -> anyhow::Result<()> {
        let has_origin = Tool::new("git")
            .args(&["remote", "get-url", "origin"])
            .timeout(Duration::from_secs(5))
            .run()
            .map(|o| o.success())
            .unwrap_or(false);
        if has_origin {
            Ok(())
        } else {
            Err(ExitError::NoRemote.into())
        }
    }

    /// Take the PID lock, evicting a stale holder with SIGTERM first.
    fn acquire_lock(&self) -> anyhow::Result<()> {
        let path = lock_path();
        if let Ok(contents) = std::fs::read_to_string(&path) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if pid != std::process::id() && pid_alive(pid) {
                    log(
                        &format!("Watcher pid {pid} holds the lock, asking it to exit"),
                        "⚠️",
                    );
                    let _ = Tool::new("kill").args(&["-TERM", &pid.to_string()]).run();
                    let deadline = Instant::now() + LOCK_STEAL_WAIT;
                    while Instant::now() < deadline && pid_alive(pid) {
                        std::thread::sleep(Duration::from_millis(200));
                    }
                    if pid_alive(pid) {
                        return Err(ExitError::LockHeld { pid }.into());
                    }
                }
            }
        }
        std::fs::create_dir_all(STATE_DIR).context("creating state directory")?;
        std::fs::write(&path, format!("{}\n", std::process::id()))
            .context("writing watcher lock")?;
        Ok(())
    }

    fn release_lock(&self) {
        let path = lock_path();
        if let Ok(contents) = std::fs::read_to_string(&path) {
            if contents.trim() == std::process::id().to_string() {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

impl Default for Watcher {
    fn default() -> Self {
        Self::new()
    }
}

fn pid_alive(pid: u32) -> bool {
    Tool::new("kill")
        .args(&["-0", &pid.to_string()])
        .run()
        .map(|o| o.success())
        .unwrap_or(false)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn agent_window_names() {
        assert!(is_agent_window("developer-ravel"));
        assert!(is_agent_window("security-reviewer-bach"));
        assert!(is_agent_window("integrator-glass"));
        assert!(!is_agent_window("main"));
        assert!(!is_agent_window("board"));
        assert!(!is_agent_window("developer"));
    }

    #[test]
    fn state_entry_round_trip() {
        let agent = AgentRecord::for_tests("bd-001", Role::Developer, Stage::Development);
        let entry = StateEntry::from(&agent);
        assert_eq!(entry.agent, "developer-test");
        assert_eq!(entry.role, "developer");
        assert!(entry.tmux);
        assert_eq!(entry.pid, None);

        let json = serde_json::to_string(&entry).unwrap();
        let back: StateEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.agent, entry.agent);
        assert_eq!(back.started_at, entry.started_at);
    }

    #[test]
    fn tmux_record_liveness_follows_window_cache() {
        let mut agent = AgentRecord::for_tests("bd-001", Role::Developer, Stage::Development);
        let mut windows = HashSet::new();
        assert!(!agent.is_alive(&windows));
        windows.insert("developer-test".to_string());
        assert!(agent.is_alive(&windows));
    }
}
