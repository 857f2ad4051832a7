//! Agent spawning: names, worktrees, and process/window launch.

use std::collections::HashSet;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::Context;
use rand::seq::IndexedRandom;

use crate::config::{AGENT_STARTUP_DELAY, SESSION_NAME, STATE_DIR, YOLO_MODE, log};
use crate::events::{Event, EventKind};
use crate::prompts;
use crate::stage::{Role, Stage};
use crate::subprocess::Tool;
use crate::tmux;
use crate::transitions::{MAX_RETRIES, epoch_secs};
use crate::watcher::{AgentHandle, AgentRecord, Watcher};
use crate::worktree;

/// Hard cap on how many times a single bead may be spawned, across all
/// stages and retries.
pub const MAX_TOTAL_SPAWNS: u32 = 20;

const COMPOSERS: [&str; 71] = [
    "bach", "mozart", "beethoven", "chopin", "liszt", "brahms", "wagner",
    "tchaikovsky", "dvorak", "grieg", "rachmaninoff", "ravel", "prokofiev",
    "stravinsky", "gershwin", "copland", "bernstein", "glass", "reich",
    "handel", "haydn", "schubert", "schumann", "mendelssohn", "verdi", "puccini",
    "rossini", "vivaldi", "mahler", "bruckner", "sibelius", "elgar", "holst",
    "debussy", "faure", "satie", "bizet", "offenbach", "berlioz", "saint-saens",
    "mussorgsky", "rimsky", "borodin", "scriabin", "shostakovich", "khachaturian",
    "bartok", "kodaly", "janacek", "smetana", "nielsen", "vaughan", "britten",
    "walton", "tippett", "barber", "ives", "cage", "feldman", "adams", "corigliano",
    "part", "gorecki", "ligeti", "xenakis", "boulez", "stockhausen", "berio",
    "nono", "messiaen", "dutilleux",
];

/// Allocate a unique `role-composer` name, falling back to a numeric suffix
/// when the pool is exhausted.
pub fn allocate_name(used_names: &mut HashSet<String>, role: Role) -> String {
    let available: Vec<&str> = COMPOSERS
        .iter()
        .copied()
        .filter(|composer| !used_names.contains(&format!("{role}-{composer}")))
        .collect();
    let name = match available.choose(&mut rand::rng()) {
        Some(composer) => format!("{role}-{composer}"),
        None => format!("{role}-{}", used_names.len()),
    };
    used_names.insert(name.clone());
    name
}

/// Check out the working directory an agent role needs.  Returns an empty
/// path for investigators (main checkout) and on worktree failure, where
/// the agent still runs but shares the main directory.
fn create_agent_worktree(role: Role, bead_id: &str, agent_name: &str, base: &str) -> String {
    if !role.uses_worktree() {
        return String::new();
    }
    let _ = Tool::new("git")
        .args(&["fetch", "origin"])
        .timeout(Duration::from_secs(30))
        .run();

    let result = match role {
        Role::Developer => worktree::create(
            agent_name,
            &format!("feature/{bead_id}"),
            Some(&format!("origin/{base}")),
            true,
            false,
        ),
        Role::Reviewer | Role::SecurityReviewer => {
            worktree::create(agent_name, &format!("origin/feature/{bead_id}"), None, false, true)
        }
        Role::Integrator | Role::Tester => {
            worktree::create(agent_name, &format!("origin/{base}"), None, false, true)
        }
        Role::Investigator => return String::new(),
    };

    match result {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(e) => {
            log(&format!("Failed to create worktree for {agent_name}: {e:#}"), "⚠️");
            String::new()
        }
    }
}

/// POSIX single-quote escaping for values interpolated into `bash -c`.
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

fn provider_command(provider: &str, model: Option<&str>) -> String {
    let mut cmd = provider.to_string();
    if YOLO_MODE {
        cmd.push_str(" --dangerously-skip-permissions");
    }
    if let Some(model) = model {
        cmd.push_str(" --model ");
        cmd.push_str(&sh_quote(model));
    }
    cmd
}

fn spawn_tmux(
    agent_name: &str,
    bead_id: &str,
    role: Role,
    prompt: &str,
    stage: Stage,
    worktree_path: &str,
    provider: &str,
    model: Option<&str>,
) -> anyhow::Result<AgentRecord> {
    let cd_prefix = if worktree_path.is_empty() {
        String::new()
    } else {
        format!("cd {} && ", sh_quote(worktree_path))
    };
    let shell_cmd = format!(
        "{cd_prefix}export DEBUSSY_ROLE={} DEBUSSY_BEAD={}; {}",
        sh_quote(role.name()),
        sh_quote(bead_id),
        provider_command(provider, model),
    );

    tmux::new_window(agent_name, &shell_cmd)?;
    let target = format!("{SESSION_NAME}:{agent_name}");

    let pasted = (|| -> anyhow::Result<()> {
        std::thread::sleep(Duration::from_secs(AGENT_STARTUP_DELAY));
        tmux::send_literal(&target, prompt)?;
        std::thread::sleep(Duration::from_millis(500));
        tmux::press_enter(&target)
    })();
    if let Err(e) = pasted {
        tmux::kill_window(agent_name);
        return Err(e.context("pasting prompt into agent window"));
    }

    Ok(AgentRecord {
        bead: bead_id.to_string(),
        role,
        name: agent_name.to_string(),
        spawned_stage: stage,
        started_at: epoch_secs(),
        worktree_path: worktree_path.to_string(),
        log_path: String::new(),
        claimed_seen: false,
        handle: AgentHandle::Tmux,
    })
}

fn spawn_background(
    agent_name: &str,
    bead_id: &str,
    role: Role,
    prompt: &str,
    stage: Stage,
    worktree_path: &str,
    provider: &str,
    model: Option<&str>,
) -> anyhow::Result<AgentRecord> {
    let logs_dir = std::path::Path::new(STATE_DIR).join("logs");
    std::fs::create_dir_all(&logs_dir).context("creating logs directory")?;
    let log_path = logs_dir.join(format!("{agent_name}.log"));
    let log_file = std::fs::File::create(&log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;
    let log_clone = log_file.try_clone().context("duplicating log handle")?;

    let mut cmd = Command::new(provider);
    if YOLO_MODE {
        cmd.arg("--dangerously-skip-permissions");
    }
    if let Some(model) = model {
        cmd.args(["--model", model]);
    }
    cmd.args(["--print", prompt])
        .env("DEBUSSY_ROLE", role.name())
        .env("DEBUSSY_BEAD", bead_id)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_clone));
    if !worktree_path.is_empty() {
        cmd.current_dir(worktree_path);
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("spawning {provider} for {bead_id}"))?;

    Ok(AgentRecord {
        bead: bead_id.to_string(),
        role,
        name: agent_name.to_string(),
        spawned_stage: stage,
        started_at: epoch_secs(),
        worktree_path: worktree_path.to_string(),
        log_path: log_path.to_string_lossy().into_owned(),
        claimed_seen: false,
        handle: AgentHandle::Child(child),
    })
}

/// Launch one agent for a bead.  Returns true when an agent actually
/// started.
pub fn spawn_agent(
    w: &mut Watcher,
    role: Role,
    bead_id: &str,
    stage: Stage,
    labels: &[String],
) -> bool {
    let key = format!("{role}:{bead_id}");
    let windows = w.windows.clone();
    if let Some(existing) = w.running.get_mut(&key) {
        if existing.is_alive(&windows) {
            return false;
        }
    }
    if w.counters.failures.get(bead_id).copied().unwrap_or(0) >= MAX_RETRIES {
        return false;
    }

    let agent_name = allocate_name(&mut w.used_names, role);
    log(&format!("Spawning {agent_name} for {bead_id}"), "🚀");

    let base = w
        .config
        .base_branch
        .clone()
        .unwrap_or_else(|| "master".to_string());
    let worktree_path = create_agent_worktree(role, bead_id, &agent_name, &base);
    let prompt = prompts::get_prompt(
        role,
        bead_id,
        stage,
        labels,
        w.config.base_branch.as_deref(),
    );

    let provider = w.config.agent_provider.clone();
    let model = w.config.role_models.get(role.name()).cloned();
    let use_tmux = w.config.use_tmux_windows && tmux::in_tmux();

    let spawned = if use_tmux {
        spawn_tmux(
            &agent_name,
            bead_id,
            role,
            &prompt,
            stage,
            &worktree_path,
            &provider,
            model.as_deref(),
        )
    } else {
        spawn_background(
            &agent_name,
            bead_id,
            role,
            &prompt,
            stage,
            &worktree_path,
            &provider,
            model.as_deref(),
        )
    };

    match spawned {
        Ok(agent) => {
            if agent.is_tmux() {
                w.windows.insert(agent_name.clone());
            }
            w.running.insert(key, agent);
            *w.counters.spawn_counts.entry(bead_id.to_string()).or_insert(0) += 1;
            w.save_state();
            w.events.record(
                Event::new(bead_id, EventKind::Spawn)
                    .stage(stage)
                    .agent(&agent_name),
            );
            true
        }
        Err(e) => {
            let failures = *w
                .counters
                .failures
                .entry(bead_id.to_string())
                .and_modify(|c| *c += 1)
                .or_insert(1);
            log(
                &format!("Spawn failed for {bead_id} ({failures}/{MAX_RETRIES}): {e:#}"),
                "💥",
            );
            w.used_names.remove(&agent_name);
            if !worktree_path.is_empty() {
                let _ = worktree::remove(&agent_name);
            }
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_per_role() {
        let mut used = HashSet::new();
        let mut seen = HashSet::new();
        for _ in 0..COMPOSERS.len() {
            let name = allocate_name(&mut used, Role::Developer);
            assert!(name.starts_with("developer-"));
            assert!(seen.insert(name));
        }
    }

    #[test]
    fn exhausted_pool_falls_back_to_numbered_names() {
        let mut used = HashSet::new();
        for _ in 0..COMPOSERS.len() {
            allocate_name(&mut used, Role::Reviewer);
        }
        let overflow = allocate_name(&mut used, Role::Reviewer);
        assert_eq!(overflow, format!("reviewer-{}", COMPOSERS.len()));
    }

    #[test]
    fn same_composer_can_serve_different_roles() {
        let mut used = HashSet::new();
        used.extend(
            COMPOSERS[1..]
                .iter()
                .map(|c| format!("developer-{c}")),
        );
        let dev = allocate_name(&mut used, Role::Developer);
        assert_eq!(dev, format!("developer-{}", COMPOSERS[0]));
        let tester = allocate_name(&mut used, Role::Tester);
        assert!(tester.starts_with("tester-"));
    }

    #[test]
    fn shell_quoting_survives_single_quotes() {
        assert_eq!(sh_quote("plain"), "'plain'");
        assert_eq!(sh_quote("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn provider_command_includes_model_and_permissions() {
        let cmd = provider_command("claude", Some("opus"));
        assert!(cmd.starts_with("claude"));
        assert!(cmd.contains("--dangerously-skip-permissions"));
        assert!(cmd.contains("--model 'opus'"));
        assert!(!provider_command("claude", None).contains("--model"));
    }
}
