//! Stage transition engine.
//!
//! After an agent terminates, the watcher fetches the bead and asks the
//! engine what to do with it.  Dispatch is a first-match ladder over the
//! bead's post-run status and labels; every branch returns a
//! [`TransitionResult`] describing the tracker mutation, and the engine
//! applies it and then repairs the single-stage invariant.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::audit;
use crate::beads::{Bead, BeadClient, BeadStatus};
use crate::config::{atomic_write, log};
use crate::events::{Event, EventKind, EventLog};
use crate::stage::Stage;
use crate::subprocess::Tool;
use crate::watcher::AgentRecord;
use crate::worktree;

/// Consecutive crashes (or empty developer branches) before a bead blocks.
pub const MAX_RETRIES: u32 = 3;
/// Rejection loops before a bead blocks for the conductor.
pub const MAX_REJECTIONS: u32 = 5;
/// Seconds a rejected bead is ignored before it may respawn.
pub const REJECTION_COOLDOWN: u64 = 60;

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Per-bead retry bookkeeping.  Only `rejections` survives a watcher
/// restart; everything else resets, which is how an operator restart
/// unsticks a stuck bead.
#[derive(Debug)]
pub struct Counters {
    pub failures: HashMap<String, u32>,
    pub rejections: HashMap<String, u32>,
    pub empty_branch_retries: HashMap<String, u32>,
    pub spawn_counts: HashMap<String, u32>,
    /// Bead → epoch seconds of the last rejection.
    pub cooldowns: HashMap<String, u64>,
    pub blocked_failures: HashSet<String>,
    pub queued: HashSet<String>,
    rejections_path: PathBuf,
}

impl Counters {
    pub fn new(state_dir: &Path) -> Self {
        let rejections_path = state_dir.join("rejections.json");
        let rejections = std::fs::read_to_string(&rejections_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self {
            failures: HashMap::new(),
            rejections,
            empty_branch_retries: HashMap::new(),
            spawn_counts: HashMap::new(),
            cooldowns: HashMap::new(),
            blocked_failures: HashSet::new(),
            queued: HashSet::new(),
            rejections_path,
        }
    }

    /// Best-effort atomic rewrite of the rejection counter file.
    pub fn persist_rejections(&self) {
        if let Ok(data) = serde_json::to_string_pretty(&self.rejections) {
            if let Err(e) = atomic_write(&self.rejections_path, &data) {
                tracing::warn!("could not persist rejections: {e:#}");
            }
        }
    }

    pub fn in_cooldown(&self, bead_id: &str, now: u64) -> bool {
        self.cooldowns
            .get(bead_id)
            .is_some_and(|&since| now.saturating_sub(since) < REJECTION_COOLDOWN)
    }
}

/// The tracker mutation a transition resolved to.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    pub status: Option<BeadStatus>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

impl TransitionResult {
    pub fn has_changes(&self) -> bool {
        self.status.is_some() || !self.add_labels.is_empty() || !self.remove_labels.is_empty()
    }

    fn remove(labels: &[String]) -> Self {
        Self {
            remove_labels: labels.to_vec(),
            ..Self::default()
        }
    }
}

/// The engine's view of the repository.  A trait seam so transition logic is
/// testable without a git checkout.
pub trait RepoProbe {
    /// True when `origin/feature/<bead>` has commits past `origin/<base>`.
    fn branch_has_commits(&self, bead_id: &str, base: &str) -> bool;
    /// True when `origin/feature/<bead>` is an ancestor of `origin/<base>`
    /// (or the branch is already gone).
    fn merge_landed(&self, bead_id: &str, base: &str) -> bool;
    /// Delete the bead's feature branch locally and on origin.
    fn delete_branch(&self, branch: &str);
}

/// Probe backed by the real git CLI.  Transient git failures give the agent
/// the benefit of the doubt — a flaky remote must not spin beads through
/// retry loops.
pub struct GitProbe;

impl RepoProbe for GitProbe {
    fn branch_has_commits(&self, bead_id: &str, base: &str) -> bool {
        let range = format!("origin/{base}..origin/feature/{bead_id}");
        match Tool::new("git")
            .args(&["rev-list", "--count", &range])
            .timeout(Duration::from_secs(5))
            .run()
        {
            Ok(output) if output.success() => {
                output.stdout.trim().parse::<u64>().map(|n| n > 0).unwrap_or(true)
            }
            _ => true,
        }
    }

    fn merge_landed(&self, bead_id: &str, base: &str) -> bool {
        let _ = Tool::new("git")
            .args(&["fetch", "origin"])
            .timeout(Duration::from_secs(30))
            .run();
        let feature = format!("origin/feature/{bead_id}");
        let ref_check = Tool::new("git")
            .args(&["rev-parse", "--verify", &feature])
            .timeout(Duration::from_secs(5))
            .run();
        match ref_check {
            Ok(output) if output.success() => {}
            // Branch already cleaned up — nothing left to verify.
            _ => return true,
        }
        match Tool::new("git")
            .args(&["merge-base", "--is-ancestor", &feature, &format!("origin/{base}")])
            .timeout(Duration::from_secs(10))
            .run()
        {
            Ok(output) => output.success(),
            Err(_) => true,
        }
    }

    fn delete_branch(&self, branch: &str) {
        worktree::delete_branch(branch);
    }
}

/// One transition pass: dispatch plus tracker write-back.
pub struct Engine<'a> {
    pub tracker: &'a BeadClient,
    pub events: &'a EventLog,
    pub probe: &'a dyn RepoProbe,
    pub counters: &'a mut Counters,
    /// Configured base branch; unset falls back to `master`, matching the
    /// worktree checkout default.
    pub base_branch: String,
}

impl Engine<'_> {
    /// Fetch the bead and run one transition for a finished agent.
    /// Returns false when the bead could not be read or updated.
    pub fn ensure_stage_transition(&mut self, agent: &AgentRecord) -> bool {
        let Some(bead) = self.tracker.get(&agent.bead) else {
            log(
                &format!("Could not read bead {}, skipping stage transition", agent.bead),
                "⚠️",
            );
            return false;
        };
        let result = self.dispatch(agent, &bead);
        self.execute(&agent.bead, &result)
    }

    /// Decide what to do with a bead after its agent terminated.
    /// First match wins.
    pub fn dispatch(&mut self, agent: &AgentRecord, bead: &Bead) -> TransitionResult {
        let has_rejected = bead.has_label("rejected");
        let stage_labels = bead.stage_labels();
        let spawned_label = agent.spawned_stage.label();
        let had_spawned_stage = stage_labels.iter().any(|l| *l == spawned_label);

        if bead.status == BeadStatus::InProgress {
            return self.in_progress_reset(agent, &stage_labels);
        }
        if !had_spawned_stage {
            return Self::external_removal(agent, has_rejected);
        }
        if has_rejected && agent.spawned_stage == Stage::Acceptance {
            return self.acceptance_rejection(agent, &stage_labels);
        }
        if has_rejected {
            return self.rejection(agent, &stage_labels);
        }
        match bead.status {
            BeadStatus::Closed => self.closed(agent, bead, &stage_labels),
            BeadStatus::Blocked => self.blocked(agent, &stage_labels),
            BeadStatus::Open => self.advance(agent, bead, &stage_labels),
            _ => TransitionResult::remove(&stage_labels),
        }
    }

    /// The agent died (or exited) while still holding the claim.  Reset to
    /// open and keep the primary stage label so the next cycle retries.
    fn in_progress_reset(&self, agent: &AgentRecord, stage_labels: &[String]) -> TransitionResult {
        log(
            &format!(
                "Agent left {} as in_progress, resetting to open for retry",
                agent.bead
            ),
            "⚠️",
        );
        TransitionResult {
            status: Some(BeadStatus::Open),
            remove_labels: stage_labels.get(1..).unwrap_or_default().to_vec(),
            ..TransitionResult::default()
        }
    }

    /// The conductor (or a user) moved the bead while our agent ran.  Their
    /// edit is authoritative; only tidy up a leftover `rejected` label.
    fn external_removal(agent: &AgentRecord, has_rejected: bool) -> TransitionResult {
        log(
            &format!("Stage removed externally for {}, skipping transition", agent.bead),
            "⏭️",
        );
        let mut result = TransitionResult::default();
        if has_rejected {
            result.remove_labels = vec!["rejected".to_string()];
        }
        result
    }

    /// Acceptance failures always need human triage — no automatic retry.
    fn acceptance_rejection(
        &mut self,
        agent: &AgentRecord,
        stage_labels: &[String],
    ) -> TransitionResult {
        log(
            &format!(
                "Acceptance failed {}: blocked for conductor to create fix tasks",
                agent.bead
            ),
            "🚫",
        );
        self.events.record(
            Event::new(&agent.bead, EventKind::Reject).from_to(agent.spawned_stage, "blocked"),
        );
        self.tracker.comment(
            &agent.bead,
            "Acceptance failed — blocked for conductor to create fix tasks",
        );
        let mut remove = stage_labels.to_vec();
        remove.push("rejected".to_string());
        TransitionResult {
            status: Some(BeadStatus::Blocked),
            remove_labels: remove,
            ..TransitionResult::default()
        }
    }

    /// Reviewer/integrator/tester rejected the work: send the bead back to
    /// development, bounded by `MAX_REJECTIONS` and a respawn cooldown.
    fn rejection(&mut self, agent: &AgentRecord, stage_labels: &[String]) -> TransitionResult {
        let count = self
            .counters
            .rejections
            .entry(agent.bead.clone())
            .and_modify(|c| *c += 1)
            .or_insert(1)
            .to_owned();

        let mut remove = stage_labels.to_vec();
        remove.push("rejected".to_string());
        let mut result = TransitionResult {
            remove_labels: remove,
            ..TransitionResult::default()
        };

        if count >= MAX_REJECTIONS {
            result.status = Some(BeadStatus::Blocked);
            log(
                &format!("Blocked {}: rejected {count} times, needs conductor", agent.bead),
                "🚫",
            );
            self.events.record(
                Event::new(&agent.bead, EventKind::LoopBlocked)
                    .stage(agent.spawned_stage)
                    .rejections(count),
            );
            self.tracker.comment(
                &agent.bead,
                &format!("Blocked after {count} rejection loops — needs conductor intervention"),
            );
        } else {
            result.add_labels = vec![Stage::Development.label()];
            self.counters
                .cooldowns
                .insert(agent.bead.clone(), epoch_secs());
            log(
                &format!(
                    "Rejected {} ({count}/{MAX_REJECTIONS}): {} → {} (cooldown {REJECTION_COOLDOWN}s)",
                    agent.bead,
                    agent.spawned_stage,
                    Stage::Development
                ),
                "↩️",
            );
        }

        self.counters.persist_rejections();
        self.events.record(
            Event::new(&agent.bead, EventKind::Reject)
                .from_to(agent.spawned_stage, &Stage::Development.label()),
        );
        result
    }

    fn closed(&mut self, agent: &AgentRecord, bead: &Bead, stage_labels: &[String]) -> TransitionResult {
        if !agent.spawned_stage.is_terminal() {
            return self.premature_close(agent, bead, stage_labels);
        }
        if agent.spawned_stage == Stage::Merging {
            if !self.probe.merge_landed(&agent.bead, &self.base_branch) {
                return self.unverified_merge(agent, stage_labels);
            }
            let events = self.events.for_bead(&agent.bead);
            if let Err(detail) =
                audit::validate_bead_pipeline(&agent.bead, &events, bead.has_label("security"))
            {
                return self.incomplete_pipeline(agent, stage_labels, &detail);
            }
        }

        self.counters.rejections.remove(&agent.bead);
        self.counters.persist_rejections();
        self.probe.delete_branch(&format!("feature/{}", agent.bead));
        log(
            &format!("Closed {}: {} complete", agent.bead, agent.spawned_stage),
            "✅",
        );
        self.events
            .record(Event::new(&agent.bead, EventKind::Close).stage(agent.spawned_stage));
        TransitionResult::remove(stage_labels)
    }

    /// The agent closed the bead at a non-terminal stage.  Treat it as a
    /// successful completion of that stage and synthesize the advance.
    fn premature_close(
        &mut self,
        agent: &AgentRecord,
        bead: &Bead,
        stage_labels: &[String],
    ) -> TransitionResult {
        log(
            &format!(
                "Agent closed {} at non-terminal {}, reopening and advancing",
                agent.bead, agent.spawned_stage
            ),
            "⚠️",
        );
        self.events
            .record(Event::new(&agent.bead, EventKind::PrematureClose).stage(agent.spawned_stage));
        let mut result = self.advance(agent, bead, stage_labels);
        if result.status.is_none() {
            result.status = Some(BeadStatus::Open);
        }
        result
    }

    /// The integrator said merged but the feature branch is not an ancestor
    /// of the base.  Retry merging rather than record a lost close.
    fn unverified_merge(&self, agent: &AgentRecord, stage_labels: &[String]) -> TransitionResult {
        log(
            &format!(
                "Merge not verified on base branch for {}, retrying merge",
                agent.bead
            ),
            "⚠️",
        );
        self.events
            .record(Event::new(&agent.bead, EventKind::UnverifiedMerge).stage(agent.spawned_stage));
        TransitionResult {
            status: Some(BeadStatus::Open),
            remove_labels: stage_labels.to_vec(),
            add_labels: vec![Stage::Merging.label()],
        }
    }

    /// The event log lacks evidence that a required stage ran.  Block the
    /// close so nothing unreviewed slips out as done.
    fn incomplete_pipeline(
        &self,
        agent: &AgentRecord,
        stage_labels: &[String],
        detail: &str,
    ) -> TransitionResult {
        log(
            &format!("Pipeline incomplete for {}: blocked instead of closed", agent.bead),
            "🚫",
        );
        self.events
            .record(Event::new(&agent.bead, EventKind::Block).stage(agent.spawned_stage));
        self.tracker.comment(
            &agent.bead,
            &format!("Pipeline incomplete — {detail}. Blocked instead of closed."),
        );
        TransitionResult {
            status: Some(BeadStatus::Blocked),
            remove_labels: stage_labels.to_vec(),
            ..TransitionResult::default()
        }
    }

    fn blocked(&self, agent: &AgentRecord, stage_labels: &[String]) -> TransitionResult {
        log(&format!("Blocked {}: parked for conductor", agent.bead), "⊘");
        self.events
            .record(Event::new(&agent.bead, EventKind::Block).stage(agent.spawned_stage));
        TransitionResult::remove(stage_labels)
    }

    fn advance(&mut self, agent: &AgentRecord, bead: &Bead, stage_labels: &[String]) -> TransitionResult {
        let Some(next) = agent.spawned_stage.next(bead.has_label("security")) else {
            return TransitionResult::remove(stage_labels);
        };

        if agent.spawned_stage == Stage::Development
            && !self.probe.branch_has_commits(&agent.bead, &self.base_branch)
        {
            let mut result = self.empty_branch(agent);
            result.remove_labels = stage_labels.to_vec();
            return result;
        }

        self.counters.empty_branch_retries.remove(&agent.bead);
        log(
            &format!("Advancing {}: {} → {next}", agent.bead, agent.spawned_stage),
            "⏩",
        );
        self.events.record(
            Event::new(&agent.bead, EventKind::Advance).from_to(agent.spawned_stage, &next.label()),
        );
        TransitionResult {
            remove_labels: stage_labels.to_vec(),
            add_labels: vec![next.label()],
            ..TransitionResult::default()
        }
    }

    /// Developer exited without pushing commits.  Retry development a few
    /// times, then block for the conductor.
    fn empty_branch(&mut self, agent: &AgentRecord) -> TransitionResult {
        let count = self
            .counters
            .empty_branch_retries
            .entry(agent.bead.clone())
            .and_modify(|c| *c += 1)
            .or_insert(1)
            .to_owned();

        if count >= MAX_RETRIES {
            log(
                &format!(
                    "Blocked {}: empty branch after {count} attempts, needs conductor",
                    agent.bead
                ),
                "🚫",
            );
            self.events.record(
                Event::new(&agent.bead, EventKind::EmptyBranchBlocked)
                    .stage(agent.spawned_stage)
                    .retries(count),
            );
            self.tracker.comment(
                &agent.bead,
                &format!("Blocked after {count} empty-branch retries — needs conductor intervention"),
            );
            return TransitionResult {
                status: Some(BeadStatus::Blocked),
                ..TransitionResult::default()
            };
        }

        log(
            &format!(
                "No commits on feature/{} — retry {count}/{MAX_RETRIES}",
                agent.bead
            ),
            "⚠️",
        );
        self.events.record(
            Event::new(&agent.bead, EventKind::EmptyBranch)
                .stage(agent.spawned_stage)
                .retry(count),
        );
        TransitionResult {
            add_labels: vec![Stage::Development.label()],
            ..TransitionResult::default()
        }
    }

    /// Apply a result to the tracker, then repair the single-stage
    /// invariant.
    pub fn execute(&self, bead_id: &str, result: &TransitionResult) -> bool {
        if !result.has_changes() {
            return true;
        }
        if !self
            .tracker
            .update(bead_id, result.status, &result.add_labels, &result.remove_labels)
        {
            log(&format!("Stage transition failed for {bead_id}"), "⚠️");
            return false;
        }
        verify_single_stage(self.tracker, bead_id);
        true
    }
}

/// A bead carries at most one `stage:*` label.  Strip any extras, keeping
/// the first.  Run after every mutation that touches stage labels.
pub fn verify_single_stage(tracker: &BeadClient, bead_id: &str) {
    let Some(bead) = tracker.get(bead_id) else {
        return;
    };
    let stages = bead.stage_labels();
    if stages.len() <= 1 {
        return;
    }
    let extras = &stages[1..];
    if tracker.update(bead_id, None, &[], extras) {
        log(
            &format!(
                "Fixed {bead_id}: removed {} extra stage label(s), kept {}",
                extras.len(),
                stages[0]
            ),
            "🔧",
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct StubProbe {
        has_commits: bool,
        landed: bool,
        deleted: RefCell<Vec<String>>,
    }

    impl StubProbe {
        fn new() -> Self {
            Self {
                has_commits: true,
                landed: true,
                deleted: RefCell::new(Vec::new()),
            }
        }
    }

    impl RepoProbe for StubProbe {
        fn branch_has_commits(&self, _bead_id: &str, _base: &str) -> bool {
            self.has_commits
        }
        fn merge_landed(&self, _bead_id: &str, _base: &str) -> bool {
            self.landed
        }
        fn delete_branch(&self, branch: &str) {
            self.deleted.borrow_mut().push(branch.to_string());
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        tracker: BeadClient,
        events: EventLog,
        probe: StubProbe,
        counters: Counters,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let events = EventLog::at(dir.path().join("events.jsonl"));
            let counters = Counters::new(dir.path());
            Self {
                _dir: dir,
                tracker: BeadClient::new(),
                events,
                probe: StubProbe::new(),
                counters,
            }
        }

        fn dispatch(&mut self, agent: &AgentRecord, bead: &Bead) -> TransitionResult {
            let mut engine = Engine {
                tracker: &self.tracker,
                events: &self.events,
                probe: &self.probe,
                counters: &mut self.counters,
                base_branch: "master".to_string(),
            };
            engine.dispatch(agent, bead)
        }
    }

    fn agent(stage: Stage) -> AgentRecord {
        AgentRecord::for_tests("bd-001", stage.role(), stage)
    }

    fn bead(status: &str, labels: &[&str]) -> Bead {
        serde_json::from_value(serde_json::json!({
            "id": "bd-001",
            "status": status,
            "labels": labels,
        }))
        .unwrap()
    }

    #[test]
    fn development_advances_to_reviewing() {
        let mut fx = Fixture::new();
        let result = fx.dispatch(
            &agent(Stage::Development),
            &bead("open", &["stage:development"]),
        );
        assert_eq!(result.remove_labels, vec!["stage:development"]);
        assert_eq!(result.add_labels, vec!["stage:reviewing"]);
        assert_eq!(result.status, None);
    }

    #[test]
    fn reviewing_advances_to_merging() {
        let mut fx = Fixture::new();
        let result = fx.dispatch(&agent(Stage::Reviewing), &bead("open", &["stage:reviewing"]));
        assert_eq!(result.add_labels, vec!["stage:merging"]);
        assert!(result.remove_labels.contains(&"stage:reviewing".to_string()));
    }

    #[test]
    fn security_label_routes_reviewing_to_security_review() {
        let mut fx = Fixture::new();
        let result = fx.dispatch(
            &agent(Stage::Reviewing),
            &bead("open", &["stage:reviewing", "security"]),
        );
        assert_eq!(result.add_labels, vec!["stage:security-review"]);
    }

    #[test]
    fn security_review_advances_to_merging() {
        let mut fx = Fixture::new();
        let result = fx.dispatch(
            &agent(Stage::SecurityReview),
            &bead("open", &["stage:security-review", "security"]),
        );
        assert_eq!(result.add_labels, vec!["stage:merging"]);
    }

    #[test]
    fn rejection_sends_back_to_development() {
        let mut fx = Fixture::new();
        let result = fx.dispatch(
            &agent(Stage::Reviewing),
            &bead("open", &["stage:reviewing", "rejected"]),
        );
        assert_eq!(result.add_labels, vec!["stage:development"]);
        assert!(result.remove_labels.contains(&"stage:reviewing".to_string()));
        assert!(result.remove_labels.contains(&"rejected".to_string()));
        assert_eq!(fx.counters.rejections.get("bd-001"), Some(&1));
        assert!(fx.counters.cooldowns.contains_key("bd-001"));
    }

    #[test]
    fn max_rejections_blocks() {
        let mut fx = Fixture::new();
        fx.counters
            .rejections
            .insert("bd-001".to_string(), MAX_REJECTIONS - 1);
        let result = fx.dispatch(
            &agent(Stage::Reviewing),
            &bead("open", &["stage:reviewing", "rejected"]),
        );
        assert_eq!(result.status, Some(BeadStatus::Blocked));
        assert!(result.add_labels.is_empty());
        assert_eq!(fx.counters.rejections.get("bd-001"), Some(&MAX_REJECTIONS));
    }

    #[test]
    fn rejections_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut counters = Counters::new(dir.path());
        counters.rejections.insert("bd-009".to_string(), 3);
        counters.persist_rejections();

        let reloaded = Counters::new(dir.path());
        assert_eq!(reloaded.rejections.get("bd-009"), Some(&3));
        assert!(reloaded.failures.is_empty());
    }

    #[test]
    fn acceptance_rejection_blocks_without_retry() {
        let mut fx = Fixture::new();
        let result = fx.dispatch(
            &agent(Stage::Acceptance),
            &bead("open", &["stage:acceptance", "rejected"]),
        );
        assert_eq!(result.status, Some(BeadStatus::Blocked));
        assert!(result.remove_labels.contains(&"stage:acceptance".to_string()));
        assert!(result.remove_labels.contains(&"rejected".to_string()));
        assert!(result.add_labels.is_empty());
        // Acceptance rejections do not feed the rejection loop counter.
        assert!(fx.counters.rejections.is_empty());
    }

    #[test]
    fn in_progress_resets_to_open_keeping_primary_stage() {
        let mut fx = Fixture::new();
        let result = fx.dispatch(
            &agent(Stage::Development),
            &bead("in_progress", &["stage:development", "stage:reviewing"]),
        );
        assert_eq!(result.status, Some(BeadStatus::Open));
        assert_eq!(result.remove_labels, vec!["stage:reviewing"]);
    }

    #[test]
    fn external_stage_removal_is_a_no_op() {
        let mut fx = Fixture::new();
        let result = fx.dispatch(&agent(Stage::Reviewing), &bead("open", &[]));
        assert!(!result.has_changes());
    }

    #[test]
    fn external_stage_removal_clears_rejected() {
        let mut fx = Fixture::new();
        let result = fx.dispatch(&agent(Stage::Reviewing), &bead("open", &["rejected"]));
        assert_eq!(result.remove_labels, vec!["rejected"]);
        assert!(result.add_labels.is_empty());
        assert_eq!(result.status, None);
    }

    #[test]
    fn verified_merge_close_deletes_branch_and_strips_stage() {
        let mut fx = Fixture::new();
        // Give the audit a complete trail.
        fx.events.record(
            Event::new("bd-001", EventKind::Advance)
                .from_to(Stage::Development, "stage:reviewing"),
        );
        fx.events.record(
            Event::new("bd-001", EventKind::Advance).from_to(Stage::Reviewing, "stage:merging"),
        );

        let result = fx.dispatch(&agent(Stage::Merging), &bead("closed", &["stage:merging"]));
        assert_eq!(result.status, None);
        assert_eq!(result.remove_labels, vec!["stage:merging"]);
        assert_eq!(
            fx.probe.deleted.borrow().as_slice(),
            ["feature/bd-001".to_string()]
        );
    }

    #[test]
    fn close_clears_rejection_counter() {
        let mut fx = Fixture::new();
        fx.counters.rejections.insert("bd-001".to_string(), 3);
        fx.events.record(
            Event::new("bd-001", EventKind::Advance)
                .from_to(Stage::Development, "stage:reviewing"),
        );
        fx.events.record(
            Event::new("bd-001", EventKind::Advance).from_to(Stage::Reviewing, "stage:merging"),
        );

        fx.dispatch(&agent(Stage::Merging), &bead("closed", &["stage:merging"]));
        assert!(!fx.counters.rejections.contains_key("bd-001"));
    }

    #[test]
    fn unverified_merge_retries_merging() {
        let mut fx = Fixture::new();
        fx.probe.landed = false;
        let result = fx.dispatch(&agent(Stage::Merging), &bead("closed", &["stage:merging"]));
        assert_eq!(result.status, Some(BeadStatus::Open));
        assert_eq!(result.add_labels, vec!["stage:merging"]);
        assert!(result.remove_labels.contains(&"stage:merging".to_string()));
        assert!(fx.probe.deleted.borrow().is_empty());
    }

    #[test]
    fn incomplete_pipeline_blocks_close() {
        let mut fx = Fixture::new();
        // No events recorded at all: the audit cannot prove any stage ran.
        let result = fx.dispatch(&agent(Stage::Merging), &bead("closed", &["stage:merging"]));
        assert_eq!(result.status, Some(BeadStatus::Blocked));
        assert!(result.remove_labels.contains(&"stage:merging".to_string()));
        assert!(result.add_labels.is_empty());
        assert!(fx.probe.deleted.borrow().is_empty());
    }

    #[test]
    fn incomplete_security_pipeline_blocks_close() {
        let mut fx = Fixture::new();
        fx.events.record(
            Event::new("bd-001", EventKind::Advance)
                .from_to(Stage::Development, "stage:reviewing"),
        );
        fx.events.record(
            Event::new("bd-001", EventKind::Advance).from_to(Stage::Reviewing, "stage:merging"),
        );
        // Security bead without a security-review completion.
        let result = fx.dispatch(
            &agent(Stage::Merging),
            &bead("closed", &["stage:merging", "security"]),
        );
        assert_eq!(result.status, Some(BeadStatus::Blocked));
    }

    #[test]
    fn blocked_bead_parks_without_status_change() {
        let mut fx = Fixture::new();
        let result = fx.dispatch(
            &agent(Stage::Development),
            &bead("blocked", &["stage:development"]),
        );
        assert_eq!(result.status, None);
        assert!(result.remove_labels.contains(&"stage:development".to_string()));
    }

    #[test]
    fn empty_branch_retries_development() {
        let mut fx = Fixture::new();
        fx.probe.has_commits = false;
        let result = fx.dispatch(
            &agent(Stage::Development),
            &bead("open", &["stage:development"]),
        );
        assert_eq!(result.add_labels, vec!["stage:development"]);
        assert!(result.remove_labels.contains(&"stage:development".to_string()));
        assert_eq!(fx.counters.empty_branch_retries.get("bd-001"), Some(&1));
    }

    #[test]
    fn empty_branch_cap_blocks() {
        let mut fx = Fixture::new();
        fx.probe.has_commits = false;
        fx.counters
            .empty_branch_retries
            .insert("bd-001".to_string(), MAX_RETRIES - 1);
        let result = fx.dispatch(
            &agent(Stage::Development),
            &bead("open", &["stage:development"]),
        );
        assert_eq!(result.status, Some(BeadStatus::Blocked));
    }

    #[test]
    fn advance_clears_empty_branch_counter() {
        let mut fx = Fixture::new();
        fx.counters
            .empty_branch_retries
            .insert("bd-001".to_string(), 2);
        fx.dispatch(
            &agent(Stage::Development),
            &bead("open", &["stage:development"]),
        );
        assert!(!fx.counters.empty_branch_retries.contains_key("bd-001"));
    }

    #[test]
    fn premature_close_reopens_and_advances() {
        let mut fx = Fixture::new();
        for (stage, next) in [
            (Stage::Development, "stage:reviewing"),
            (Stage::Reviewing, "stage:merging"),
            (Stage::SecurityReview, "stage:merging"),
        ] {
            let label = stage.label();
            let result = fx.dispatch(&agent(stage), &bead("closed", &[label.as_str()]));
            assert_eq!(result.status, Some(BeadStatus::Open), "stage {stage}");
            assert_eq!(result.add_labels, vec![next.to_string()], "stage {stage}");
        }
    }

    #[test]
    fn premature_close_with_empty_branch_retries_development() {
        let mut fx = Fixture::new();
        fx.probe.has_commits = false;
        let result = fx.dispatch(
            &agent(Stage::Development),
            &bead("closed", &["stage:development"]),
        );
        assert_eq!(result.status, Some(BeadStatus::Open));
        assert_eq!(result.add_labels, vec!["stage:development"]);
    }

    #[test]
    fn cooldown_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut counters = Counters::new(dir.path());
        let now = epoch_secs();
        counters.cooldowns.insert("bd-001".to_string(), now);
        assert!(counters.in_cooldown("bd-001", now + REJECTION_COOLDOWN - 1));
        assert!(!counters.in_cooldown("bd-001", now + REJECTION_COOLDOWN));
        assert!(!counters.in_cooldown("bd-002", now));
    }

    #[test]
    fn transition_result_change_detection() {
        assert!(!TransitionResult::default().has_changes());
        assert!(
            TransitionResult {
                status: Some(BeadStatus::Open),
                ..TransitionResult::default()
            }
            .has_changes()
        );
        assert!(
            TransitionResult {
                add_labels: vec!["stage:reviewing".to_string()],
                ..TransitionResult::default()
            }
            .has_changes()
        );
    }

    #[test]
    fn dispatch_is_deterministic_for_pure_branches() {
        let mut fx = Fixture::new();
        let a = fx.dispatch(
            &agent(Stage::Development),
            &bead("open", &["stage:development"]),
        );
        let b = fx.dispatch(
            &agent(Stage::Development),
            &bead("open", &["stage:development"]),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_status_strips_stage_labels() {
        let mut fx = Fixture::new();
        let result = fx.dispatch(
            &agent(Stage::Development),
            &bead("planning", &["stage:development"]),
        );
        assert_eq!(result.remove_labels, vec!["stage:development"]);
        assert_eq!(result.status, None);
    }
}
