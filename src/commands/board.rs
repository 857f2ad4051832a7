//! Kanban-style board rendered from tracker state.

use std::collections::{HashMap, HashSet};

use crate::beads::{Bead, BeadClient, BeadStatus};
use crate::watcher::{self, StateEntry};

use super::status::print_runtime_info;

const DONE_LIMIT: usize = 5;
const STAGE_LIMIT: usize = 50;
const DEFAULT_WIDTH: usize = 100;

const PIPELINE_COLUMNS: [(&str, &str); 7] = [
    ("dev", "Dev"),
    ("review", "Review"),
    ("sec-review", "Sec Review"),
    ("merge", "Merge"),
    ("accept", "Accept"),
    ("backlog", "Backlog"),
    ("done", "Done"),
];
const INVESTIGATION_COLUMNS: [(&str, &str); 2] = [
    ("investigating", "Investigating"),
    ("consolidating", "Consolidating"),
];

fn column_for_label(label: &str) -> Option<&'static str> {
    match label {
        "stage:development" => Some("dev"),
        "stage:reviewing" => Some("review"),
        "stage:security-review" => Some("sec-review"),
        "stage:merging" => Some("merge"),
        "stage:acceptance" => Some("accept"),
        "stage:investigating" => Some("investigating"),
        "stage:consolidating" => Some("consolidating"),
        _ => None,
    }
}

fn categorize(bead: &Bead, parent_ids: &HashSet<&str>) -> &'static str {
    if bead.status == BeadStatus::Closed {
        return "done";
    }
    if parent_ids.contains(bead.id.as_str()) {
        return "skip";
    }
    for label in &bead.labels {
        if let Some(column) = column_for_label(label) {
            return column;
        }
    }
    "backlog"
}

/// Waiting beads render dimmed: blocked, or a dependency not known closed.
fn is_waiting(bead: &Bead) -> bool {
    bead.status == BeadStatus::Blocked
        || bead
            .dependencies
            .iter()
            .any(|d| d.status != Some(BeadStatus::Closed))
}

fn sort_key(bead: &Bead, running: &HashMap<String, StateEntry>) -> (bool, bool, i64, String) {
    (
        !running.contains_key(&bead.id),
        !is_waiting(bead),
        bead.priority.unwrap_or(99),
        bead.id.clone(),
    )
}

fn marker(bead: &Bead, running: &HashMap<String, StateEntry>) -> String {
    if let Some(info) = running.get(&bead.id) {
        return format!(" 🔄 {}", info.agent);
    }
    if is_waiting(bead) {
        return " ⊘".to_string();
    }
    String::new()
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(2)).collect();
    out.push_str("..");
    out
}

fn pad(text: &str, width: usize) -> String {
    let len = text.chars().count();
    if len >= width {
        text.to_string()
    } else {
        format!("{text}{}", " ".repeat(width - len))
    }
}

fn group_done<'a>(
    done: &[&'a Bead],
    beads_by_id: &HashMap<&str, &Bead>,
) -> (Vec<(String, String, usize, usize)>, Vec<&'a Bead>) {
    let mut closed_counts: HashMap<String, usize> = HashMap::new();
    let mut orphans = Vec::new();
    for bead in done {
        match bead.parent_id.as_deref() {
            Some(parent_id) => *closed_counts.entry(parent_id.to_string()).or_insert(0) += 1,
            None => orphans.push(*bead),
        }
    }

    let mut groups: Vec<(String, String, usize, usize)> = closed_counts
        .into_iter()
        .map(|(parent_id, closed)| {
            let total = beads_by_id
                .values()
                .filter(|b| b.parent_id.as_deref() == Some(parent_id.as_str()))
                .count();
            let title = beads_by_id
                .get(parent_id.as_str())
                .map_or_else(|| parent_id.clone(), |b| b.title.clone());
            (parent_id, title, closed, total)
        })
        .collect();
    groups.sort_by(|a, b| b.0.cmp(&a.0));
    (groups, orphans)
}

fn render_done(done: &[&Bead], beads_by_id: &HashMap<&str, &Bead>, width: usize) -> Vec<String> {
    if done.is_empty() {
        return vec![" ".repeat(width)];
    }
    let (groups, orphans) = group_done(done, beads_by_id);
    let mut lines = Vec::new();
    for (_pid, title, closed, total) in groups.iter().take(DONE_LIMIT) {
        let entry = if closed == total {
            format!("{title} ✓ ({closed}/{total})")
        } else {
            format!("{title} ({closed}/{total})")
        };
        lines.push(pad(&truncate(&entry, width), width));
    }
    let remaining = DONE_LIMIT.saturating_sub(lines.len());
    for bead in orphans.iter().take(remaining) {
        let entry = format!("{} {}", bead.id, bead.title);
        lines.push(pad(&truncate(&entry, width), width));
    }
    let total_items = groups.len() + orphans.len();
    if total_items > DONE_LIMIT {
        lines.push(pad(&format!("+{} more", total_items - DONE_LIMIT), width));
    }
    if lines.is_empty() {
        lines.push(" ".repeat(width));
    }
    lines
}

fn render_vertical(
    columns: &[(&str, &str)],
    buckets: &HashMap<&str, Vec<&Bead>>,
    running: &HashMap<String, StateEntry>,
    beads_by_id: &HashMap<&str, &Bead>,
    term_width: usize,
) -> String {
    let label_width = columns.iter().map(|(_, t)| t.chars().count()).max().unwrap_or(8) + 5;
    let content_width = term_width.saturating_sub(label_width + 3).max(20);

    let top = format!("┌{}┬{}┐", "─".repeat(label_width), "─".repeat(content_width));
    let sep = format!("├{}┼{}┤", "─".repeat(label_width), "─".repeat(content_width));
    let bottom = format!("└{}┴{}┘", "─".repeat(label_width), "─".repeat(content_width));

    let mut lines = vec![top];
    for (i, (key, title)) in columns.iter().enumerate() {
        let empty = Vec::new();
        let beads = buckets.get(key).unwrap_or(&empty);
        let count = beads.len();
        let label = if count > 0 {
            format!("{title} ({count})")
        } else {
            (*title).to_string()
        };
        let label_cell = pad(&label, label_width);

        let content_lines = if *key == "done" {
            render_done(beads, beads_by_id, content_width)
        } else if beads.is_empty() {
            vec![" ".repeat(content_width)]
        } else {
            let shown = &beads[..beads.len().min(STAGE_LIMIT)];
            let mut content: Vec<String> = shown
                .iter()
                .map(|bead| {
                    let entry = format!("{} {}{}", bead.id, bead.title, marker(bead, running));
                    pad(&truncate(&entry, content_width), content_width)
                })
                .collect();
            let overflow = count - shown.len();
            if overflow > 0 {
                content.push(pad(&format!("+{overflow} more"), content_width));
            }
            content
        };

        for (j, content) in content_lines.iter().enumerate() {
            let label_part = if j == 0 {
                label_cell.clone()
            } else {
                " ".repeat(label_width)
            };
            lines.push(format!("│{label_part}│{content}│"));
        }
        if i < columns.len() - 1 {
            lines.push(sep.clone());
        }
    }
    lines.push(bottom);
    lines.join("\n")
}

fn term_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|c| c.parse().ok())
        .unwrap_or(DEFAULT_WIDTH)
}

pub fn run() {
    let all_beads = BeadClient::new().list_all();
    let running = watcher::load_state();
    let beads_by_id: HashMap<&str, &Bead> = all_beads.iter().map(|b| (b.id.as_str(), b)).collect();
    let parent_ids: HashSet<&str> = all_beads
        .iter()
        .filter_map(|b| b.parent_id.as_deref())
        .collect();

    let mut pipeline: HashMap<&str, Vec<&Bead>> = HashMap::new();
    let mut investigation: HashMap<&str, Vec<&Bead>> = HashMap::new();
    let investigation_keys: HashSet<&str> =
        INVESTIGATION_COLUMNS.iter().map(|(k, _)| *k).collect();

    for bead in &all_beads {
        let column = categorize(bead, &parent_ids);
        if column == "skip" {
            continue;
        }
        if investigation_keys.contains(column) {
            investigation.entry(column).or_default().push(bead);
        } else {
            pipeline.entry(column).or_default().push(bead);
        }
    }

    for bucket in pipeline.values_mut().chain(investigation.values_mut()) {
        bucket.sort_by_key(|b| sort_key(b, &running));
    }
    if let Some(done) = pipeline.get_mut("done") {
        done.sort_by(|a, b| b.id.cmp(&a.id));
    }

    let width = term_width();
    println!(
        "{}",
        render_vertical(&PIPELINE_COLUMNS, &pipeline, &running, &beads_by_id, width)
    );

    if INVESTIGATION_COLUMNS
        .iter()
        .any(|(k, _)| investigation.get(k).is_some_and(|b| !b.is_empty()))
    {
        println!();
        println!(
            "{}",
            render_vertical(
                &INVESTIGATION_COLUMNS,
                &investigation,
                &running,
                &beads_by_id,
                width
            )
        );
    }

    println!();
    print_runtime_info(&running);
}
