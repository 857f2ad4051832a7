//! Runtime status display: live agents, branches, per-feature progress.

use std::collections::HashMap;
use std::time::Duration;

use crate::beads::{Bead, BeadClient, BeadStatus};
use crate::config::Config;
use crate::subprocess::Tool;
use crate::transitions::epoch_secs;
use crate::watcher::{self, StateEntry};

use super::metrics::fmt_duration;

pub fn run() {
    println!("\n=== DEBUSSY STATUS ===\n");
    let running = watcher::load_state();
    print_runtime_info(&running);
    let all_beads = BeadClient::new().list_all();
    print_parent_progress(&all_beads);
}

pub fn print_runtime_info(running: &HashMap<String, StateEntry>) {
    let cfg = Config::load();
    let base = cfg.base_branch.as_deref().unwrap_or("not set");
    println!("  base: {base}  agents: {}/{}", running.len(), cfg.max_total_agents);
    println!();

    if !running.is_empty() {
        println!("Agents:");
        let now = epoch_secs();
        let mut entries: Vec<(&String, &StateEntry)> = running.iter().collect();
        entries.sort_by_key(|(bead_id, _)| (*bead_id).clone());
        for (bead_id, info) in entries {
            let duration = if info.started_at > 0 {
                fmt_duration(now.saturating_sub(info.started_at) as f64)
            } else {
                "?".to_string()
            };
            println!("  {} ({}) → {bead_id}  [{duration}]", info.agent, info.role);
        }
        println!();
    }

    let branches = feature_branches();
    if !branches.is_empty() {
        println!("Branches ({}):", branches.len());
        for branch in branches {
            println!("  {branch}");
        }
        println!();
    }
}

fn feature_branches() -> Vec<String> {
    let list = match Tool::new("git")
        .args(&["branch", "--list", "feature/*"])
        .timeout(Duration::from_secs(5))
        .run()
    {
        Ok(o) if o.success() => o,
        _ => return Vec::new(),
    };
    let current = Tool::new("git")
        .args(&["branch", "--show-current"])
        .timeout(Duration::from_secs(5))
        .run()
        .map(|o| o.stdout.trim().to_string())
        .unwrap_or_default();

    list.stdout
        .lines()
        .filter_map(|line| {
            let branch = line.trim().trim_start_matches(['*', ' ']);
            if branch.is_empty() {
                return None;
            }
            let marker = if branch == current { " *" } else { "" };
            Some(format!("{branch}{marker}"))
        })
        .collect()
}

fn print_parent_progress(all_beads: &[Bead]) {
    let mut by_parent: HashMap<&str, Vec<&Bead>> = HashMap::new();
    let mut beads_by_id: HashMap<&str, &Bead> = HashMap::new();
    for bead in all_beads {
        if let Some(parent_id) = bead.parent_id.as_deref() {
            by_parent.entry(parent_id).or_default().push(bead);
        }
        beads_by_id.insert(bead.id.as_str(), bead);
    }
    if by_parent.is_empty() {
        return;
    }

    println!("Features:");
    let mut parents: Vec<(&&str, &Vec<&Bead>)> = by_parent.iter().collect();
    parents.sort_by_key(|(pid, _)| **pid);
    for (parent_id, children) in parents {
        let title = beads_by_id
            .get(*parent_id)
            .map_or(*parent_id, |b| b.title.as_str());
        let closed = children
            .iter()
            .filter(|c| c.status == BeadStatus::Closed)
            .count();
        let total = children.len();
        let check = if closed == total { " ✓" } else { "" };
        println!("  {title} ({closed}/{total}){check}");
    }
    println!();
}
