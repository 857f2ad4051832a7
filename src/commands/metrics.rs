//! Pipeline metrics folded from the event log: per-bead stage trails,
//! stage averages, rejection/timeout totals.

use std::collections::HashMap;

use crate::events::{Event, EventKind, EventLog};
use crate::stage::{STAGE_PREFIX, Stage};

pub fn fmt_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{}s", seconds as u64)
    } else if seconds < 3600.0 {
        format!("{}m", (seconds / 60.0) as u64)
    } else {
        format!("{:.1}h", seconds / 3600.0)
    }
}

/// Compact stage name for trail rendering.
fn short(stage_label: &str) -> String {
    let name = stage_label.strip_prefix(STAGE_PREFIX).unwrap_or(stage_label);
    match name {
        "development" => "dev",
        "reviewing" => "review",
        "security-review" => "sec-rev",
        "merging" => "merge",
        "acceptance" => "accept",
        "investigating" => "invest",
        "consolidating" => "consol",
        other => other,
    }
    .to_string()
}

struct BeadMetrics {
    trail: String,
    total: f64,
    stage_durations: HashMap<String, Vec<f64>>,
    rejections: u32,
    timeouts: u32,
}

fn format_stage_entry(
    stage: &str,
    duration: f64,
    stage_counts: &mut HashMap<String, u32>,
) -> String {
    let count = stage_counts
        .entry(stage.to_string())
        .and_modify(|c| *c += 1)
        .or_insert(1);
    let count_str = if *count > 1 {
        format!("{count}x ")
    } else {
        String::new()
    };
    format!("{}({count_str}{})", short(stage), fmt_duration(duration))
}

fn process_bead_events(mut events: Vec<Event>) -> BeadMetrics {
    events.sort_by(|a, b| a.ts.total_cmp(&b.ts));

    let mut stages: Vec<String> = Vec::new();
    let mut stage_counts: HashMap<String, u32> = HashMap::new();
    let mut stage_durations: HashMap<String, Vec<f64>> = HashMap::new();
    let mut current_stage: Option<String> = None;
    let mut stage_start: Option<f64> = None;
    let mut rejections = 0;
    let mut timeouts = 0;

    for event in &events {
        match event.event {
            EventKind::Spawn => {
                current_stage = event.stage.clone();
                stage_start = Some(event.ts);
            }
            EventKind::Advance | EventKind::Close => {
                if let (Some(start), Some(stage)) = (stage_start, current_stage.as_deref()) {
                    let dur = event.ts - start;
                    stages.push(format_stage_entry(stage, dur, &mut stage_counts));
                    stage_durations.entry(stage.to_string()).or_default().push(dur);
                }
                if event.event == EventKind::Close {
                    stages.push("done".to_string());
                } else {
                    current_stage = event.to.clone();
                    stage_start = Some(event.ts);
                }
            }
            EventKind::Reject => {
                rejections += 1;
                if let (Some(start), Some(stage)) = (stage_start, current_stage.as_deref()) {
                    let dur = event.ts - start;
                    stages.push(format!("{}({}!)", short(stage), fmt_duration(dur)));
                    stage_durations.entry(stage.to_string()).or_default().push(dur);
                }
                current_stage = event.to.clone();
                stage_start = Some(event.ts);
            }
            EventKind::Timeout => timeouts += 1,
            _ => {}
        }
    }

    let total = if events.len() > 1 {
        events[events.len() - 1].ts - events[0].ts
    } else {
        0.0
    };
    let trail = if stages.is_empty() {
        "started".to_string()
    } else {
        stages.join(" → ")
    };

    BeadMetrics {
        trail,
        total,
        stage_durations,
        rejections,
        timeouts,
    }
}

pub fn run() {
    let events = EventLog::new().load();
    if events.is_empty() {
        println!("No pipeline events recorded yet.");
        return;
    }

    let mut by_bead: HashMap<String, Vec<Event>> = HashMap::new();
    for event in events {
        by_bead.entry(event.bead.clone()).or_default().push(event);
    }

    let mut trails: Vec<(String, String, f64)> = Vec::new();
    let mut all_durations: HashMap<String, Vec<f64>> = HashMap::new();
    let mut total_rejections = 0;
    let mut total_timeouts = 0;

    let mut bead_ids: Vec<String> = by_bead.keys().cloned().collect();
    bead_ids.sort();
    for bead_id in bead_ids {
        let Some(bead_events) = by_bead.remove(&bead_id) else {
            continue;
        };
        let metrics = process_bead_events(bead_events);
        total_rejections += metrics.rejections;
        total_timeouts += metrics.timeouts;
        for (stage, durs) in metrics.stage_durations {
            all_durations.entry(stage).or_default().extend(durs);
        }
        trails.push((bead_id, metrics.trail, metrics.total));
    }

    println!("\n=== PIPELINE METRICS ===\n");
    println!("Per-bead:");
    for (bead_id, trail, total) in &trails {
        println!("  {bead_id}  {trail}  [{}]", fmt_duration(*total));
    }
    println!();

    let mut averages = Vec::new();
    for stage in [
        Stage::Development,
        Stage::Reviewing,
        Stage::SecurityReview,
        Stage::Merging,
        Stage::Acceptance,
    ] {
        if let Some(durs) = all_durations.get(&stage.label()) {
            if !durs.is_empty() {
                let avg = durs.iter().sum::<f64>() / durs.len() as f64;
                averages.push((short(&stage.label()), avg, durs.len()));
            }
        }
    }
    if !averages.is_empty() {
        println!("Stage averages:");
        for (name, avg, count) in averages {
            println!("  {name:8} avg {:>5}  ({count} passes)", fmt_duration(avg));
        }
        println!();
    }

    if total_rejections > 0 || total_timeouts > 0 {
        println!("Issues: {total_rejections} rejections, {total_timeouts} timeouts");
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, ts: f64) -> Event {
        let mut e = Event::new("bd-001", kind);
        e.ts = ts;
        e
    }

    #[test]
    fn durations_format_by_magnitude() {
        assert_eq!(fmt_duration(42.0), "42s");
        assert_eq!(fmt_duration(90.0), "1m");
        assert_eq!(fmt_duration(3599.0), "59m");
        assert_eq!(fmt_duration(5400.0), "1.5h");
    }

    #[test]
    fn short_names() {
        assert_eq!(short("stage:development"), "dev");
        assert_eq!(short("stage:security-review"), "sec-rev");
        assert_eq!(short("stage:something-new"), "something-new");
    }

    #[test]
    fn trail_follows_spawn_advance_close() {
        let mut spawn = event(EventKind::Spawn, 0.0);
        spawn.stage = Some("stage:development".to_string());
        let mut advance = event(EventKind::Advance, 120.0);
        advance.from_stage = Some("stage:development".to_string());
        advance.to = Some("stage:reviewing".to_string());
        let mut close = event(EventKind::Close, 180.0);
        close.stage = Some("stage:merging".to_string());

        let metrics = process_bead_events(vec![spawn, advance, close]);
        assert_eq!(metrics.trail, "dev(2m) → review(1m) → done");
        assert_eq!(metrics.total, 180.0);
        assert_eq!(metrics.rejections, 0);
    }

    #[test]
    fn rejections_mark_the_trail() {
        let mut spawn = event(EventKind::Spawn, 0.0);
        spawn.stage = Some("stage:reviewing".to_string());
        let mut reject = event(EventKind::Reject, 30.0);
        reject.from_stage = Some("stage:reviewing".to_string());
        reject.to = Some("stage:development".to_string());

        let metrics = process_bead_events(vec![spawn, reject]);
        assert!(metrics.trail.contains("review(30s!)"));
        assert_eq!(metrics.rejections, 1);
    }

    #[test]
    fn timeouts_are_counted() {
        let metrics = process_bead_events(vec![event(EventKind::Timeout, 5.0)]);
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.trail, "started");
    }
}
