//! Git worktree lifecycle for parallel agent isolation.
//!
//! Every non-investigator agent gets a dedicated working directory under
//! `.debussy-worktrees/<agent-name>` so concurrent agents never stomp on
//! each other.  The tracker database (`.beads`) and the watcher state
//! directory (`.debussy`) are symlinked into each worktree so agents share
//! one tracker and one event log.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::config::{STATE_DIR, log};
use crate::subprocess::Tool;

pub const WORKTREES_DIR: &str = ".debussy-worktrees";
const BEADS_DIR: &str = ".beads";

const QUICK: Duration = Duration::from_secs(5);
const LOCAL: Duration = Duration::from_secs(10);
const REMOVE: Duration = Duration::from_secs(15);
const NETWORK: Duration = Duration::from_secs(30);

fn repo_root() -> anyhow::Result<PathBuf> {
    let output = Tool::new("git")
        .args(&["rev-parse", "--show-toplevel"])
        .timeout(QUICK)
        .run_ok()
        .context("locating repository root")?;
    Ok(PathBuf::from(output.stdout.trim()))
}

fn worktree_path(agent_name: &str) -> anyhow::Result<PathBuf> {
    Ok(repo_root()?.join(WORKTREES_DIR).join(agent_name))
}

fn symlink_shared_dirs(worktree: &Path, repo: &Path) {
    for name in [BEADS_DIR, STATE_DIR] {
        let src = repo.join(name);
        let dest = worktree.join(name);
        if src.exists() && !dest.exists() {
            let target = std::fs::canonicalize(&src).unwrap_or(src);
            #[cfg(unix)]
            if let Err(e) = std::os::unix::fs::symlink(&target, &dest) {
                tracing::warn!("could not link {} into worktree: {e}", target.display());
            }
        }
    }
}

fn unlink_shared_dirs(worktree: &Path) {
    for name in [BEADS_DIR, STATE_DIR] {
        let link = worktree.join(name);
        if link.is_symlink() {
            let _ = std::fs::remove_file(&link);
        }
    }
}

fn branch_exists(branch: &str) -> bool {
    Tool::new("git")
        .args(&["rev-parse", "--verify", branch])
        .timeout(QUICK)
        .run()
        .map(|o| o.success())
        .unwrap_or(false)
}

/// Parse `git worktree list --porcelain` into (path, branch) pairs.
/// Detached worktrees carry no branch.
fn parse_worktree_list(porcelain: &str) -> Vec<(PathBuf, Option<String>)> {
    let mut entries = Vec::new();
    let mut current: Option<PathBuf> = None;
    let mut branch: Option<String> = None;
    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(path) = current.take() {
                entries.push((path, branch.take()));
            }
            current = Some(PathBuf::from(path));
        } else if let Some(b) = line.strip_prefix("branch ") {
            branch = Some(b.trim_start_matches("refs/heads/").to_string());
        }
    }
    if let Some(path) = current {
        entries.push((path, branch));
    }
    entries
}

fn list_worktrees() -> Vec<(PathBuf, Option<String>)> {
    Tool::new("git")
        .args(&["worktree", "list", "--porcelain"])
        .timeout(LOCAL)
        .run()
        .map(|o| parse_worktree_list(&o.stdout))
        .unwrap_or_default()
}

/// If some worktree under our directory already holds `branch`, evict it so
/// the branch can be checked out fresh.
fn remove_worktree_for_branch(branch: &str) -> anyhow::Result<()> {
    let wt_dir = repo_root()?.join(WORKTREES_DIR);
    for (path, wt_branch) in list_worktrees() {
        if wt_branch.as_deref() == Some(branch) && path.starts_with(&wt_dir) {
            if let Some(agent_name) = path.file_name().and_then(|n| n.to_str()) {
                remove(agent_name)?;
                log(
                    &format!("Removed stale worktree {agent_name} holding branch {branch}"),
                    "🧹",
                );
            }
        }
    }
    Ok(())
}

/// Create a worktree for an agent.
///
/// `new_branch` creates `branch` (from `start_point`) unless it already
/// exists; `detach` checks out `branch` as a detached HEAD.
pub fn create(
    agent_name: &str,
    branch: &str,
    start_point: Option<&str>,
    new_branch: bool,
    detach: bool,
) -> anyhow::Result<PathBuf> {
    let wt_path = worktree_path(agent_name)?;
    let repo = repo_root()?;

    if wt_path.exists() {
        remove(agent_name)?;
    }
    if !detach {
        remove_worktree_for_branch(branch)?;
    }
    if let Some(parent) = wt_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let wt_str = wt_path.to_string_lossy().into_owned();
    let args: Vec<&str> = if detach {
        vec!["worktree", "add", "--detach", &wt_str, branch]
    } else if new_branch && !branch_exists(branch) {
        let mut a = vec!["worktree", "add", "-b", branch, &wt_str];
        if let Some(start) = start_point {
            a.push(start);
        }
        a
    } else {
        vec!["worktree", "add", &wt_str, branch]
    };

    let mut output = Tool::new("git").args(&args).timeout(NETWORK).run()?;

    // A leftover local branch can shadow the requested start point; recreate
    // it from scratch and retry once.
    if !output.success()
        && new_branch
        && start_point.is_some()
        && branch_exists(branch)
    {
        let _ = Tool::new("git")
            .args(&["branch", "-D", branch])
            .timeout(LOCAL)
            .run();
        if wt_path.exists() {
            let _ = std::fs::remove_dir_all(&wt_path);
        }
        let mut retry = vec!["worktree", "add", "-b", branch, &wt_str];
        if let Some(start) = start_point {
            retry.push(start);
        }
        output = Tool::new("git").args(&retry).timeout(NETWORK).run()?;
    }

    if !output.success() {
        anyhow::bail!(
            "git worktree add failed for {agent_name}: {}",
            output.stderr.trim()
        );
    }

    symlink_shared_dirs(&wt_path, &repo);
    Ok(wt_path)
}

/// Tear down an agent's worktree.  Falls back to deleting the directory and
/// pruning when git refuses.
pub fn remove(agent_name: &str) -> anyhow::Result<()> {
    let wt_path = worktree_path(agent_name)?;
    if !wt_path.exists() {
        return Ok(());
    }

    unlink_shared_dirs(&wt_path);

    let wt_str = wt_path.to_string_lossy().into_owned();
    let output = Tool::new("git")
        .args(&["worktree", "remove", "--force", &wt_str])
        .timeout(REMOVE)
        .run()?;
    if !output.success() && wt_path.exists() {
        let _ = std::fs::remove_dir_all(&wt_path);
        let _ = Tool::new("git")
            .args(&["worktree", "prune"])
            .timeout(LOCAL)
            .run();
    }
    Ok(())
}

/// Delete local `feature/*` branches whose remote counterpart is gone.
pub fn cleanup_orphaned_branches() {
    let _ = Tool::new("git")
        .args(&["fetch", "--prune"])
        .timeout(NETWORK)
        .run();
    let output = match Tool::new("git")
        .args(&["branch", "--list", "feature/*"])
        .timeout(LOCAL)
        .run()
    {
        Ok(o) if o.success() => o,
        _ => return,
    };
    for line in output.stdout.lines() {
        let branch = line.trim().trim_start_matches(['+', '*', ' ']);
        if branch.is_empty() {
            continue;
        }
        if !branch_exists(&format!("origin/{branch}")) {
            let _ = Tool::new("git")
                .args(&["branch", "-D", branch])
                .timeout(LOCAL)
                .run();
            log(&format!("Deleted orphaned local branch: {branch}"), "🧹");
        }
    }
}

/// Remove directories under `.debussy-worktrees/` that git no longer lists.
pub fn cleanup_stale_worktrees() {
    let _ = Tool::new("git")
        .args(&["worktree", "prune"])
        .timeout(LOCAL)
        .run();
    let Ok(repo) = repo_root() else { return };
    let wt_dir = repo.join(WORKTREES_DIR);
    if !wt_dir.exists() {
        return;
    }

    let active: std::collections::HashSet<PathBuf> = list_worktrees()
        .into_iter()
        .map(|(path, _)| std::fs::canonicalize(&path).unwrap_or(path))
        .collect();

    let Ok(children) = std::fs::read_dir(&wt_dir) else {
        return;
    };
    for child in children.flatten() {
        let path = child.path();
        if !path.is_dir() {
            continue;
        }
        let resolved = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
        if !active.contains(&resolved) {
            unlink_shared_dirs(&path);
            let _ = std::fs::remove_dir_all(&path);
            log(
                &format!(
                    "Cleaned stale worktree: {}",
                    child.file_name().to_string_lossy()
                ),
                "🧹",
            );
        }
    }
}

/// Delete a branch locally and on origin.  Both calls are best-effort.
pub fn delete_branch(branch: &str) {
    let _ = Tool::new("git")
        .args(&["branch", "-D", branch])
        .timeout(LOCAL)
        .run();
    let _ = Tool::new("git")
        .args(&["push", "origin", "--delete", branch])
        .timeout(REMOVE)
        .run();
}

/// Remove every agent worktree (watcher shutdown / `clear`).
pub fn remove_all() {
    let Ok(repo) = repo_root() else { return };
    let wt_dir = repo.join(WORKTREES_DIR);
    if !wt_dir.exists() {
        return;
    }
    if let Ok(children) = std::fs::read_dir(&wt_dir) {
        for child in children.flatten() {
            let path = child.path();
            if path.is_dir() {
                unlink_shared_dirs(&path);
                let _ = std::fs::remove_dir_all(&path);
            }
        }
    }
    let _ = Tool::new("git")
        .args(&["worktree", "prune"])
        .timeout(LOCAL)
        .run();
    let _ = std::fs::remove_dir_all(&wt_dir);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn porcelain_parse_branches_and_detached() {
        let porcelain = "\
worktree /repo
HEAD abc123
branch refs/heads/master

worktree /repo/.debussy-worktrees/developer-ravel
HEAD def456
branch refs/heads/feature/bd-001

worktree /repo/.debussy-worktrees/reviewer-satie
HEAD 0123ab
detached
";
        let entries = parse_worktree_list(porcelain);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].1.as_deref(), Some("master"));
        assert_eq!(
            entries[1],
            (
                PathBuf::from("/repo/.debussy-worktrees/developer-ravel"),
                Some("feature/bd-001".to_string())
            )
        );
        assert_eq!(entries[2].1, None);
    }

    #[test]
    fn porcelain_parse_empty() {
        assert!(parse_worktree_list("").is_empty());
    }
}
