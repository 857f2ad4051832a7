//! Pipeline completeness audit.
//!
//! A bead may only close if the event log shows every required stage was
//! actually completed: an `advance` out of a stage or a `close` at it.
//! Security-labelled beads additionally require the security review stage.

use std::collections::HashSet;

use crate::beads::BeadClient;
use crate::events::{Event, EventKind, EventLog};
use crate::stage::{STAGE_PREFIX, Stage};

/// Stages a bead must have completed, as labels.
pub fn required_stages(has_security: bool) -> HashSet<String> {
    let mut required = HashSet::from([
        Stage::Development.label(),
        Stage::Reviewing.label(),
        Stage::Merging.label(),
    ]);
    if has_security {
        required.insert(Stage::SecurityReview.label());
    }
    required
}

/// Stages with completion evidence in a bead's events.
pub fn completed_stages(events: &[Event]) -> HashSet<String> {
    let mut completed = HashSet::new();
    for event in events {
        match event.event {
            EventKind::Advance => {
                if let Some(from) = &event.from_stage {
                    completed.insert(from.clone());
                }
            }
            EventKind::Close => {
                if let Some(stage) = &event.stage {
                    completed.insert(stage.clone());
                }
            }
            _ => {}
        }
    }
    completed
}

fn missing_report(bead_id: &str, has_security: bool, missing: &HashSet<String>) -> String {
    let tag = if has_security { " (security)" } else { "" };
    let mut names: Vec<&str> = missing
        .iter()
        .map(|s| s.strip_prefix(STAGE_PREFIX).unwrap_or(s))
        .collect();
    names.sort_unstable();
    format!("{bead_id}{tag}: missing stages: {}", names.join(", "))
}

/// Close-time check run by the transition engine while the bead sits at
/// `merging` — the merging close itself is the event being decided, so it is
/// excluded from the required set.
pub fn validate_bead_pipeline(
    bead_id: &str,
    events: &[Event],
    has_security: bool,
) -> Result<(), String> {
    if events.is_empty() {
        return Err(format!("{bead_id}: no pipeline events found"));
    }
    let completed = completed_stages(events);
    let mut required = required_stages(has_security);
    required.remove(&Stage::Merging.label());
    let missing: HashSet<String> = required.difference(&completed).cloned().collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(missing_report(bead_id, has_security, &missing))
    }
}

/// Full-trail check for one dependency of an acceptance bead (merging
/// included — by acceptance time the merge must have landed and closed).
pub fn audit_dep_bead(
    client: &BeadClient,
    bead_id: &str,
    events: &[Event],
) -> (bool, String) {
    let has_security = client
        .get(bead_id)
        .is_some_and(|b| b.has_label("security"));

    if events.is_empty() {
        return (false, format!("{bead_id}: no pipeline events found"));
    }

    let completed = completed_stages(events);
    let required = required_stages(has_security);
    let missing: HashSet<String> = required.difference(&completed).cloned().collect();

    if missing.is_empty() {
        (true, format!("{bead_id}: ok"))
    } else {
        (false, missing_report(bead_id, has_security, &missing))
    }
}

/// Audit every dependency of an acceptance bead, returning overall pass and
/// a per-dependency report.
pub fn audit_acceptance(client: &BeadClient, log: &EventLog, bead_id: &str) -> (bool, String) {
    let Some(bead) = client.get(bead_id) else {
        return (false, format!("Could not read acceptance bead {bead_id}"));
    };
    if bead.dependencies.is_empty() {
        return (true, "No dependencies to audit".to_string());
    }

    let all_events = log.load();
    let mut results = Vec::new();
    let mut all_passed = true;
    for dep in &bead.dependencies {
        if dep.id.is_empty() {
            continue;
        }
        let dep_events: Vec<Event> = all_events
            .iter()
            .filter(|e| e.bead == dep.id)
            .cloned()
            .collect();
        let (ok, detail) = audit_dep_bead(client, &dep.id, &dep_events);
        results.push(detail);
        if !ok {
            all_passed = false;
        }
    }

    (all_passed, results.join("\n"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn advance(from: Stage, to: Stage) -> Event {
        Event::new("bd-001", EventKind::Advance).from_to(from, &to.label())
    }

    fn close(stage: Stage) -> Event {
        Event::new("bd-001", EventKind::Close).stage(stage)
    }

    fn reject(from: Stage) -> Event {
        Event::new("bd-001", EventKind::Reject).from_to(from, &Stage::Development.label())
    }

    #[test]
    fn advance_collects_from_stages() {
        let events = vec![
            advance(Stage::Development, Stage::Reviewing),
            advance(Stage::Reviewing, Stage::Merging),
        ];
        let completed = completed_stages(&events);
        assert!(completed.contains("stage:development"));
        assert!(completed.contains("stage:reviewing"));
        assert!(!completed.contains("stage:merging"));
    }

    #[test]
    fn close_collects_terminal_stage() {
        let completed = completed_stages(&[close(Stage::Merging)]);
        assert_eq!(completed, HashSet::from(["stage:merging".to_string()]));
    }

    #[test]
    fn rejections_are_not_completions() {
        assert!(completed_stages(&[reject(Stage::Reviewing)]).is_empty());
    }

    #[test]
    fn required_sets() {
        assert_eq!(required_stages(false).len(), 3);
        let sec = required_stages(true);
        assert_eq!(sec.len(), 4);
        assert!(sec.contains("stage:security-review"));
    }

    #[test]
    fn full_normal_trail_passes() {
        let events = vec![
            advance(Stage::Development, Stage::Reviewing),
            advance(Stage::Reviewing, Stage::Merging),
        ];
        assert!(validate_bead_pipeline("bd-001", &events, false).is_ok());
    }

    #[test]
    fn security_trail_passes() {
        let events = vec![
            advance(Stage::Development, Stage::Reviewing),
            advance(Stage::Reviewing, Stage::SecurityReview),
            advance(Stage::SecurityReview, Stage::Merging),
        ];
        assert!(validate_bead_pipeline("bd-001", &events, true).is_ok());
    }

    #[test]
    fn security_bead_missing_security_review_fails() {
        let events = vec![
            advance(Stage::Development, Stage::Reviewing),
            advance(Stage::Reviewing, Stage::Merging),
        ];
        let err = validate_bead_pipeline("bd-001", &events, true).unwrap_err();
        assert!(err.contains("security-review"));
        assert!(err.contains("(security)"));
    }

    #[test]
    fn missing_review_stage_fails() {
        let events = vec![advance(Stage::Development, Stage::Merging)];
        let err = validate_bead_pipeline("bd-001", &events, false).unwrap_err();
        assert!(err.contains("reviewing"));
    }

    #[test]
    fn rejection_then_full_completion_passes() {
        let events = vec![
            advance(Stage::Development, Stage::Reviewing),
            reject(Stage::Reviewing),
            advance(Stage::Development, Stage::Reviewing),
            advance(Stage::Reviewing, Stage::Merging),
        ];
        assert!(validate_bead_pipeline("bd-001", &events, false).is_ok());
    }

    #[test]
    fn no_events_fails() {
        let err = validate_bead_pipeline("bd-001", &[], false).unwrap_err();
        assert!(err.contains("no pipeline events"));
    }

    #[test]
    fn dep_audit_requires_merging_close() {
        // audit_dep_bead hits the tracker for the security label; with no
        // tracker available the bead is treated as non-security.
        let client = BeadClient::new();
        let events = vec![
            advance(Stage::Development, Stage::Reviewing),
            advance(Stage::Reviewing, Stage::Merging),
        ];
        let (ok, detail) = audit_dep_bead(&client, "bd-001", &events);
        assert!(!ok);
        assert!(detail.contains("merging"));

        let mut full = events;
        full.push(close(Stage::Merging));
        let (ok, detail) = audit_dep_bead(&client, "bd-001", &full);
        assert!(ok, "{detail}");
    }
}
