//! `debussy start` — build the tmux session and attach.

use crate::config::Config;
use crate::tmux;

pub fn run(requirement: Option<&str>) -> anyhow::Result<()> {
    let config = Config::load();
    tmux::create_layout(&config.agent_provider)?;
    tmux::label_panes()?;
    tmux::send_conductor_prompt(requirement)?;

    println!("🎼 Debussy started");
    println!();
    println!("Layout:");
    println!("  ┌──────────┬──────────┬──────────┐");
    println!("  │conductor │  board   │          │");
    println!("  ├──────────┤          │ watcher  │");
    println!("  │   cmd    │          │          │");
    println!("  └──────────┴──────────┴──────────┘");
    println!();

    tmux::attach()
}
