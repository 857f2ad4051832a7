//! Debussy — multi-agent pipeline watcher for coding agents.
//!
//! A long-lived watcher polls an external issue tracker (`bd`), launches one
//! LLM agent per eligible work item in an isolated git worktree, and drives
//! each item through a fixed develop → review → merge → acceptance pipeline
//! via a deterministic transition engine.

pub mod audit;
pub mod beads;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod prompts;
pub mod scanner;
pub mod spawner;
pub mod stage;
pub mod subprocess;
pub mod telemetry;
pub mod tmux;
pub mod transitions;
pub mod watcher;
pub mod worktree;
