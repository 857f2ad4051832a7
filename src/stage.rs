//! The pipeline's stage and role vocabulary.
//!
//! A bead's position in the pipeline is a `stage:*` label on the tracker.
//! Stages map one-to-one onto the agent role that services them; successor
//! lookups drive every advance the transition engine performs.

use std::fmt;

pub const STAGE_PREFIX: &str = "stage:";

/// One step of the pipeline, as carried in a `stage:<name>` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Development,
    Reviewing,
    SecurityReview,
    Merging,
    Acceptance,
    Investigating,
    Consolidating,
}

impl Stage {
    /// All stages, in the order the scanner visits them.
    pub const ALL: [Stage; 7] = [
        Stage::Development,
        Stage::Reviewing,
        Stage::SecurityReview,
        Stage::Merging,
        Stage::Acceptance,
        Stage::Investigating,
        Stage::Consolidating,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Development => "development",
            Stage::Reviewing => "reviewing",
            Stage::SecurityReview => "security-review",
            Stage::Merging => "merging",
            Stage::Acceptance => "acceptance",
            Stage::Investigating => "investigating",
            Stage::Consolidating => "consolidating",
        }
    }

    /// The tracker label for this stage, e.g. `stage:development`.
    pub fn label(self) -> String {
        format!("{STAGE_PREFIX}{}", self.name())
    }

    /// Parse a `stage:<name>` label.
    pub fn from_label(label: &str) -> Option<Stage> {
        let name = label.strip_prefix(STAGE_PREFIX)?;
        Stage::ALL.into_iter().find(|s| s.name() == name)
    }

    /// Successor stage once an agent completes this one.  Beads carrying the
    /// `security` label detour through security review before merging.
    pub fn next(self, security: bool) -> Option<Stage> {
        if security && self == Stage::Reviewing {
            return Some(Stage::SecurityReview);
        }
        match self {
            Stage::Development => Some(Stage::Reviewing),
            Stage::Reviewing | Stage::SecurityReview => Some(Stage::Merging),
            _ => None,
        }
    }

    /// Terminal stages have no automatic successor.
    pub fn is_terminal(self) -> bool {
        self.next(false).is_none()
    }

    /// The agent role that services this stage.
    pub fn role(self) -> Role {
        match self {
            Stage::Development => Role::Developer,
            Stage::Reviewing => Role::Reviewer,
            Stage::SecurityReview => Role::SecurityReviewer,
            Stage::Merging => Role::Integrator,
            Stage::Acceptance => Role::Tester,
            Stage::Investigating | Stage::Consolidating => Role::Investigator,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{STAGE_PREFIX}{}", self.name())
    }
}

/// The kind of agent launched for a bead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Developer,
    Reviewer,
    SecurityReviewer,
    Integrator,
    Tester,
    Investigator,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Developer,
        Role::Reviewer,
        Role::SecurityReviewer,
        Role::Integrator,
        Role::Tester,
        Role::Investigator,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Role::Developer => "developer",
            Role::Reviewer => "reviewer",
            Role::SecurityReviewer => "security-reviewer",
            Role::Integrator => "integrator",
            Role::Tester => "tester",
            Role::Investigator => "investigator",
        }
    }

    pub fn from_name(name: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|r| r.name() == name)
    }

    /// Singleton roles get at most one live agent per watcher.
    pub fn is_singleton(self) -> bool {
        self == Role::Integrator
    }

    /// Investigators run in the main checkout instead of a worktree.
    pub fn uses_worktree(self) -> bool {
        self != Role::Investigator
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Extract the `stage:*` labels from a bead's label set, in order.
pub fn stage_labels(labels: &[String]) -> Vec<String> {
    labels
        .iter()
        .filter(|l| l.starts_with(STAGE_PREFIX))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_table() {
        assert_eq!(Stage::Development.next(false), Some(Stage::Reviewing));
        assert_eq!(Stage::Reviewing.next(false), Some(Stage::Merging));
        assert_eq!(Stage::SecurityReview.next(false), Some(Stage::Merging));
        assert_eq!(Stage::Merging.next(false), None);
        assert_eq!(Stage::Acceptance.next(false), None);
        assert_eq!(Stage::Investigating.next(false), None);
        assert_eq!(Stage::Consolidating.next(false), None);
    }

    #[test]
    fn security_routes_reviewing_to_security_review() {
        assert_eq!(Stage::Reviewing.next(true), Some(Stage::SecurityReview));
        // Other stages are unaffected by the security flag.
        assert_eq!(Stage::Development.next(true), Some(Stage::Reviewing));
        assert_eq!(Stage::SecurityReview.next(true), Some(Stage::Merging));
    }

    #[test]
    fn terminal_stages() {
        assert!(!Stage::Development.is_terminal());
        assert!(!Stage::Reviewing.is_terminal());
        assert!(!Stage::SecurityReview.is_terminal());
        assert!(Stage::Merging.is_terminal());
        assert!(Stage::Acceptance.is_terminal());
        assert!(Stage::Investigating.is_terminal());
        assert!(Stage::Consolidating.is_terminal());
    }

    #[test]
    fn label_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_label(&stage.label()), Some(stage));
        }
        assert_eq!(Stage::from_label("stage:unknown"), None);
        assert_eq!(Stage::from_label("development"), None);
    }

    #[test]
    fn stage_to_role() {
        assert_eq!(Stage::Development.role(), Role::Developer);
        assert_eq!(Stage::Reviewing.role(), Role::Reviewer);
        assert_eq!(Stage::SecurityReview.role(), Role::SecurityReviewer);
        assert_eq!(Stage::Merging.role(), Role::Integrator);
        assert_eq!(Stage::Acceptance.role(), Role::Tester);
        assert_eq!(Stage::Investigating.role(), Role::Investigator);
        assert_eq!(Stage::Consolidating.role(), Role::Investigator);
    }

    #[test]
    fn only_integrator_is_singleton() {
        for role in Role::ALL {
            assert_eq!(role.is_singleton(), role == Role::Integrator);
        }
    }

    #[test]
    fn stage_label_filter() {
        let labels = vec![
            "security".to_string(),
            "stage:development".to_string(),
            "rejected".to_string(),
            "stage:reviewing".to_string(),
        ];
        assert_eq!(
            stage_labels(&labels),
            vec!["stage:development", "stage:reviewing"]
        );
    }
}
