//! `debussy config` / `pause` / `resume`.

use crate::config::{Config, log};
use crate::error::ExitError;

const KNOWN_KEYS: [&str; 7] = [
    "paused",
    "max_total_agents",
    "agent_timeout",
    "base_branch",
    "use_tmux_windows",
    "agent_provider",
    "role_models",
];

pub fn run(key: Option<&str>, value: Option<&str>) -> anyhow::Result<()> {
    match (key, value) {
        (Some(key), Some(value)) => {
            let mut cfg = Config::load();
            cfg.set_key(key, value)?;
            cfg.save()?;
            log(&format!("Set {key} = {value}"), "✓");
            Ok(())
        }
        (Some(key), None) => {
            let cfg = Config::load();
            match cfg.get_key(key) {
                Some(value) => {
                    println!("{key} = {value}");
                    Ok(())
                }
                None => Err(ExitError::Config(format!("unknown config key: {key}")).into()),
            }
        }
        _ => {
            let cfg = Config::load();
            println!("Current config:");
            for key in KNOWN_KEYS {
                if let Some(value) = cfg.get_key(key) {
                    println!("  {key} = {value}");
                }
            }
            Ok(())
        }
    }
}

/// Freeze scanning.  Running agents keep draining: reaping, timeouts, and
/// orphan resets continue while paused.
pub fn pause() -> anyhow::Result<()> {
    let mut cfg = Config::load();
    cfg.paused = true;
    cfg.save()?;
    log("Paused — no new agents will start; running work drains", "⏸️");
    Ok(())
}

pub fn resume() -> anyhow::Result<()> {
    let mut cfg = Config::load();
    cfg.paused = false;
    cfg.save()?;
    log("Resumed — pipeline scanning re-enabled", "▶️");
    Ok(())
}
