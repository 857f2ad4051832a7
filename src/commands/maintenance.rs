//! Tracker housekeeping: `init`, `backup`, `clear`.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::config::{STATE_DIR, log};
use crate::subprocess::Tool;
use crate::worktree;

const BEADS_DIR: &str = ".beads";

/// Initialize the tracker database if it does not exist yet.
pub fn init() -> anyhow::Result<()> {
    if Path::new(BEADS_DIR).exists() {
        log("Tracker already initialized", "•");
        return Ok(());
    }
    Tool::new("bd")
        .arg("init")
        .run_ok()
        .context("initializing beads database")?;
    log("Initialized beads", "✓");
    Ok(())
}

/// Copy `.beads` into a timestamped directory under `.debussy/backups/`.
pub fn backup() -> anyhow::Result<PathBuf> {
    let src = Path::new(BEADS_DIR);
    if !src.exists() {
        anyhow::bail!("nothing to back up: {BEADS_DIR} does not exist");
    }
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let dest = Path::new(STATE_DIR)
        .join("backups")
        .join(format!("beads_{stamp}"));
    copy_dir(src, &dest)
        .with_context(|| format!("backing up {BEADS_DIR} to {}", dest.display()))?;
    log(&format!("Backed up {BEADS_DIR} to {}", dest.display()), "💾");
    Ok(dest)
}

/// Back up the tracker, then wipe tracker and watcher state and re-init.
/// Backups under `.debussy/backups/` are kept.
pub fn clear() -> anyhow::Result<()> {
    if Path::new(BEADS_DIR).exists() {
        backup()?;
        std::fs::remove_dir_all(BEADS_DIR).context("removing .beads")?;
        log("Removed .beads", "🗑");
    }

    let state_dir = Path::new(STATE_DIR);
    if state_dir.exists() {
        for entry in std::fs::read_dir(state_dir).context("reading state directory")? {
            let entry = entry?;
            if entry.file_name() == "backups" {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)
                    .with_context(|| format!("removing {}", path.display()))?;
            } else {
                std::fs::remove_file(&path)
                    .with_context(|| format!("removing {}", path.display()))?;
            }
        }
        log("Cleared .debussy runtime state", "🗑");
    }

    worktree::remove_all();

    Tool::new("bd")
        .arg("init")
        .run_ok()
        .context("re-initializing beads database")?;
    log("Initialized fresh beads", "✓");
    Ok(())
}

fn copy_dir(src: &Path, dest: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn copy_dir_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a.json"), "{}").unwrap();
        std::fs::write(src.join("nested/b.json"), "[]").unwrap();

        let dest = dir.path().join("dest");
        copy_dir(&src, &dest).unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("a.json")).unwrap(), "{}");
        assert_eq!(
            std::fs::read_to_string(dest.join("nested/b.json")).unwrap(),
            "[]"
        );
    }
}
