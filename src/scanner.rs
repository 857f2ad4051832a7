//! Pipeline scanning: decide which beads get an agent this cycle, plus the
//! lifecycle sweeps (dependency release, orphan reset, parent auto-close).

use std::collections::HashSet;
use std::time::Duration;

use crate::beads::{Bead, BeadStatus};
use crate::config::log;
use crate::events::{Event, EventKind};
use crate::spawner::{self, MAX_TOTAL_SPAWNS};
use crate::stage::{Role, Stage};
use crate::subprocess::Tool;
use crate::transitions::{self, MAX_RETRIES, epoch_secs};
use crate::watcher::Watcher;

/// Spawns per watcher cycle are capped to smooth load on the tracker and
/// the git remote.
pub const MAX_SPAWNS_PER_CYCLE: u32 = 2;

/// Scan every stage for launchable beads, spending at most
/// `MAX_SPAWNS_PER_CYCLE` spawns.
pub fn check_pipeline(w: &mut Watcher) {
    let mut budget = MAX_SPAWNS_PER_CYCLE;
    for stage in Stage::ALL {
        if budget == 0 {
            break;
        }
        budget -= scan_stage(w, stage, budget);
    }
}

fn scan_stage(w: &mut Watcher, stage: Stage, budget: u32) -> u32 {
    let mut beads = w.tracker.list(BeadStatus::Open, Some(&stage.label()));
    if beads.is_empty() {
        return 0;
    }
    sort_bugs_first(&mut beads);

    let role = stage.role();
    let mut spawned = 0;
    for bead in &beads {
        if spawned >= budget {
            break;
        }
        if let Some(reason) = should_skip(w, bead, role) {
            tracing::debug!("skipping {}: {reason}", bead.id);
            continue;
        }
        w.counters.queued.remove(&bead.id);
        if spawner::spawn_agent(w, role, &bead.id, stage, &bead.labels) {
            spawned += 1;
        }
    }
    spawned
}

fn sort_bugs_first(beads: &mut [Bead]) {
    beads.sort_by_key(|b| !b.is_bug());
}

/// Launch gate, first match wins.  Returns the skip reason, or None to
/// launch.
fn should_skip(w: &mut Watcher, bead: &Bead, role: Role) -> Option<&'static str> {
    if bead.id.is_empty() {
        return Some("no id");
    }
    if w.is_bead_running(&bead.id) {
        return Some("already running");
    }
    if w.counters.in_cooldown(&bead.id, epoch_secs()) {
        return Some("rejection cooldown");
    }
    if w.counters.failures.get(&bead.id).copied().unwrap_or(0) >= MAX_RETRIES {
        block_failed_bead(w, bead, "failures");
        return Some("max failures");
    }
    if w.counters.spawn_counts.get(&bead.id).copied().unwrap_or(0) >= MAX_TOTAL_SPAWNS {
        block_failed_bead(w, bead, "total spawns");
        return Some("max spawns");
    }
    // Defensive: a status=open query should never return blocked beads.
    if bead.status == BeadStatus::Blocked {
        return Some("blocked");
    }
    if let Some(reason) = check_dependencies(w, bead, role) {
        return Some(reason);
    }
    if role.is_singleton() && w.has_running_role(role) {
        queue_bead(w, &bead.id, "waiting for integrator");
        return Some("integrator busy");
    }
    if w.at_capacity() {
        queue_bead(w, &bead.id, "waiting for agent slot");
        return Some("at capacity");
    }
    None
}

/// A bead over its retry or spawn budget gets parked for the conductor.
/// Blocked beads carry no stage label, so the stage is stripped too.
fn block_failed_bead(w: &mut Watcher, bead: &Bead, reason: &str) {
    if !w.counters.blocked_failures.insert(bead.id.clone()) {
        return;
    }
    log(
        &format!("Blocked {}: max {reason}, needs conductor", bead.id),
        "🚫",
    );
    w.events
        .record(Event::new(&bead.id, EventKind::BlockedFailures));
    let _ = w.tracker.update(
        &bead.id,
        Some(BeadStatus::Blocked),
        &[],
        &bead.stage_labels(),
    );
}

fn check_dependencies(w: &mut Watcher, bead: &Bead, role: Role) -> Option<&'static str> {
    if bead.dependency_count == 0 && bead.dependencies.is_empty() {
        return None;
    }
    let Some(full) = w.tracker.get(&bead.id) else {
        return Some("unresolved deps");
    };
    if !w.tracker.unresolved_deps(&full).is_empty() {
        return Some("unresolved deps");
    }
    if role == Role::Tester {
        let unmerged = unmerged_dep_branches(&full);
        if !unmerged.is_empty() {
            queue_bead(
                w,
                &bead.id,
                &format!("{} dep branch(es) still unmerged on origin", unmerged.len()),
            );
            return Some("unmerged deps");
        }
    }
    None
}

/// Dependencies whose `feature/<dep>` branch still exists on origin have
/// not been merged yet — acceptance must wait for them.
fn unmerged_dep_branches(bead: &Bead) -> Vec<String> {
    let mut unmerged = Vec::new();
    for dep in &bead.dependencies {
        if dep.id.is_empty() {
            continue;
        }
        let exists = Tool::new("git")
            .args(&["ls-remote", "--heads", "origin", &format!("feature/{}", dep.id)])
            .timeout(Duration::from_secs(10))
            .run()
            .map(|o| o.success() && !o.stdout.trim().is_empty())
            .unwrap_or(false);
        if exists {
            unmerged.push(dep.id.clone());
        }
    }
    unmerged
}

fn queue_bead(w: &mut Watcher, bead_id: &str, reason: &str) {
    if w.counters.queued.insert(bead_id.to_string()) {
        log(&format!("Holding {bead_id}: {reason}"), "⏳");
    }
}

/// Promote beads whose dependencies just resolved: blocked → open, and add
/// `stage:development` when no stage label survives.
pub fn release_ready(w: &mut Watcher) {
    for status in [BeadStatus::Blocked, BeadStatus::Open] {
        for bead in w.tracker.list(status, None) {
            try_release(w, &bead, status);
        }
    }
}

fn try_release(w: &mut Watcher, bead: &Bead, status: BeadStatus) {
    if bead.id.is_empty() || (bead.dependency_count == 0 && bead.dependencies.is_empty()) {
        return;
    }
    let Some(full) = w.tracker.get(&bead.id) else {
        return;
    };
    if !w.tracker.unresolved_deps(&full).is_empty() {
        return;
    }

    // Blocked acceptance beads wait for the conductor, not for deps.
    if status == BeadStatus::Blocked && full.has_label(&Stage::Acceptance.label()) {
        return;
    }

    let has_stage = !full.stage_labels().is_empty();
    let new_status = (status == BeadStatus::Blocked).then_some(BeadStatus::Open);
    let add = if has_stage {
        Vec::new()
    } else {
        vec![Stage::Development.label()]
    };
    if new_status.is_none() && add.is_empty() {
        return;
    }

    if !w.tracker.update(&bead.id, new_status, &add, &[]) {
        return;
    }
    if has_stage {
        log(&format!("Unblocked {}: deps resolved", bead.id), "🔓");
        w.events.record(Event::new(&bead.id, EventKind::Unblock));
    } else {
        log(
            &format!("Released {}: deps resolved → {}", bead.id, Stage::Development),
            "🔓",
        );
        w.events
            .record(Event::new(&bead.id, EventKind::Release).stage(Stage::Development));
    }
    transitions::verify_single_stage(&w.tracker, &bead.id);
}

/// Restore stage-labelled beads left `in_progress` by a dead agent, and
/// note which live agents currently hold a claim.
pub fn reset_orphaned(w: &mut Watcher) {
    let beads = w.tracker.list(BeadStatus::InProgress, None);
    if beads.is_empty() {
        return;
    }

    let in_progress_ids: HashSet<&str> = beads.iter().map(|b| b.id.as_str()).collect();
    for agent in w.running.values_mut() {
        if in_progress_ids.contains(agent.bead.as_str()) {
            agent.claimed_seen = true;
        }
    }

    let running_beads: HashSet<String> = w.running.values().map(|a| a.bead.clone()).collect();
    for bead in &beads {
        if bead.id.is_empty() || running_beads.contains(&bead.id) {
            continue;
        }
        if bead.stage_labels().is_empty() {
            continue;
        }
        let stages = match w.tracker.get(&bead.id) {
            Some(full) => full.stage_labels(),
            None => bead.stage_labels(),
        };
        let extras = stages.get(1..).unwrap_or_default().to_vec();
        if w
            .tracker
            .update(&bead.id, Some(BeadStatus::Open), &[], &extras)
        {
            log(&format!("Reset orphaned {}: no agent running", bead.id), "👻");
        }
    }
}

/// Close parents whose children are all closed.
pub fn auto_close_parents(w: &mut Watcher) {
    for bead in w.tracker.open_roots() {
        if bead.id.is_empty() || !bead.stage_labels().is_empty() {
            continue;
        }
        let children = w.tracker.children(&bead.id);
        if children.is_empty() {
            continue;
        }
        if children.iter().all(|c| c.status == BeadStatus::Closed) {
            if w
                .tracker
                .update(&bead.id, Some(BeadStatus::Closed), &[], &[])
            {
                log(
                    &format!("Auto-closed parent {}: all children closed", bead.id),
                    "📦",
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn bead(id: &str, issue_type: &str) -> Bead {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "status": "open",
            "issue_type": issue_type,
        }))
        .unwrap()
    }

    #[test]
    fn bugs_sort_to_the_front() {
        let mut beads = vec![
            bead("bd-001", "feature"),
            bead("bd-002", "bug"),
            bead("bd-003", "task"),
            bead("bd-004", "bug"),
        ];
        sort_bugs_first(&mut beads);
        assert_eq!(beads[0].id, "bd-002");
        assert_eq!(beads[1].id, "bd-004");
        assert_eq!(beads[2].id, "bd-001");
    }

    #[test]
    fn sort_is_stable_within_kind() {
        let mut beads = vec![
            bead("bd-010", "feature"),
            bead("bd-011", "feature"),
            bead("bd-012", "bug"),
        ];
        sort_bugs_first(&mut beads);
        assert_eq!(beads[1].id, "bd-010");
        assert_eq!(beads[2].id, "bd-011");
    }
}
