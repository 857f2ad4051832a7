//! Tmux session and window plumbing.
//!
//! The watcher optionally renders each agent in its own window of the
//! `debussy` session; `debussy start` builds the four-pane operator layout.

use std::collections::HashSet;
use std::process::Command;
use std::time::Duration;

use anyhow::Context;

use crate::config::{AGENT_STARTUP_DELAY, SESSION_NAME, YOLO_MODE};
use crate::prompts::CONDUCTOR_PROMPT;
use crate::subprocess::Tool;

const TMUX_TIMEOUT: Duration = Duration::from_secs(5);

/// True when we are running inside a tmux client.
pub fn in_tmux() -> bool {
    std::env::var_os("TMUX").is_some()
}

/// Window names of the debussy session.  One call per watcher cycle keeps
/// liveness checks off the tmux server's hot path.
pub fn list_windows() -> HashSet<String> {
    let output = Tool::new("tmux")
        .args(&["list-windows", "-t", SESSION_NAME, "-F", "#{window_name}"])
        .timeout(TMUX_TIMEOUT)
        .run();
    match output {
        Ok(o) if o.success() => o
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        _ => HashSet::new(),
    }
}

pub fn kill_window(window_name: &str) {
    let _ = Tool::new("tmux")
        .args(&["kill-window", "-t", &format!("{SESSION_NAME}:{window_name}")])
        .timeout(TMUX_TIMEOUT)
        .run();
}

/// Create a detached window running `shell_cmd` under bash.
pub fn new_window(window_name: &str, shell_cmd: &str) -> anyhow::Result<()> {
    Tool::new("tmux")
        .args(&[
            "new-window", "-d", "-t", SESSION_NAME, "-n", window_name, "bash", "-c", shell_cmd,
        ])
        .timeout(TMUX_TIMEOUT)
        .run_ok()
        .with_context(|| format!("creating tmux window {window_name}"))?;
    Ok(())
}

/// Paste text into a window without interpreting key names.
pub fn send_literal(target: &str, text: &str) -> anyhow::Result<()> {
    Tool::new("tmux")
        .args(&["send-keys", "-l", "-t", target, text])
        .timeout(TMUX_TIMEOUT)
        .run_ok()
        .with_context(|| format!("sending keys to {target}"))?;
    Ok(())
}

pub fn press_enter(target: &str) -> anyhow::Result<()> {
    Tool::new("tmux")
        .args(&["send-keys", "-t", target, "Enter"])
        .timeout(TMUX_TIMEOUT)
        .run_ok()
        .with_context(|| format!("pressing Enter in {target}"))?;
    Ok(())
}

fn run(args: &[&str]) -> anyhow::Result<()> {
    Tool::new("tmux")
        .args(args)
        .timeout(TMUX_TIMEOUT)
        .run_ok()
        .map(|_| ())
        .context("tmux")
}

/// Kill any previous session and build the operator layout:
/// conductor / cmd on the left, board and watcher to the right.
pub fn create_layout(agent_provider: &str) -> anyhow::Result<()> {
    let _ = Tool::new("tmux")
        .args(&["kill-session", "-t", SESSION_NAME])
        .timeout(TMUX_TIMEOUT)
        .run();
    run(&["new-session", "-d", "-s", SESSION_NAME, "-n", "main"])?;

    let t = format!("{SESSION_NAME}:main");
    run(&["split-window", "-h", "-p", "33", "-t", &t])?;
    run(&["split-window", "-h", "-p", "50", "-t", &format!("{t}.0")])?;
    run(&["split-window", "-v", "-p", "50", "-t", &format!("{t}.0")])?;

    std::fs::create_dir_all(crate::config::STATE_DIR).context("creating state directory")?;

    let mut agent_cmd = agent_provider.to_string();
    if YOLO_MODE {
        agent_cmd.push_str(" --dangerously-skip-permissions");
    }
    send_command(&format!("{t}.0"), &agent_cmd)?;
    send_command(&format!("{t}.2"), "watch -n 5 'debussy board'")?;
    send_command(&format!("{t}.3"), "debussy watch")?;
    Ok(())
}

fn send_command(target: &str, command: &str) -> anyhow::Result<()> {
    Tool::new("tmux")
        .args(&["send-keys", "-t", target, command, "C-m"])
        .timeout(TMUX_TIMEOUT)
        .run_ok()
        .with_context(|| format!("starting `{command}` in {target}"))?;
    Ok(())
}

const PANE_TITLES: [(&str, &str); 4] = [
    ("conductor", "fg=colour114"),
    ("cmd", "default"),
    ("board", "fg=colour208"),
    ("watcher", "fg=white"),
];

pub fn label_panes() -> anyhow::Result<()> {
    let t = format!("{SESSION_NAME}:main");
    for (idx, (title, style)) in PANE_TITLES.iter().copied().enumerate() {
        let pane = format!("{t}.{idx}");
        run(&["select-pane", "-t", &pane, "-T", title])?;
        if style != "default" {
            run(&["select-pane", "-t", &pane, "-P", style])?;
        }
    }
    run(&["set-option", "-t", SESSION_NAME, "pane-border-status", "top"])?;
    run(&["set-option", "-t", SESSION_NAME, "pane-border-format", " #{pane_title} "])?;
    run(&["select-window", "-t", &t])?;
    run(&["select-pane", "-t", &format!("{t}.0")])?;
    Ok(())
}

/// Paste the conductor prompt into its pane once the agent CLI is up.
pub fn send_conductor_prompt(requirement: Option<&str>) -> anyhow::Result<()> {
    let prompt = match requirement {
        Some(req) => format!("{CONDUCTOR_PROMPT}\n\nUser requirement: {req}"),
        None => CONDUCTOR_PROMPT.to_string(),
    };
    let target = format!("{SESSION_NAME}:main.0");
    std::thread::sleep(Duration::from_secs(AGENT_STARTUP_DELAY));
    send_literal(&target, &prompt)?;
    std::thread::sleep(Duration::from_millis(500));
    press_enter(&target)
}

/// Attach the caller's terminal to the session.  Runs interactively, so it
/// bypasses the capturing `Tool` wrapper.
pub fn attach() -> anyhow::Result<()> {
    let status = Command::new("tmux")
        .args(["attach-session", "-t", SESSION_NAME])
        .status()
        .context("attaching to tmux session")?;
    if !status.success() {
        anyhow::bail!("tmux attach exited with {status}");
    }
    Ok(())
}
