use std::process::ExitCode;

use clap::{Parser, Subcommand};

use debussy::commands;
use debussy::error::ExitError;
use debussy::telemetry;
use debussy::watcher::Watcher;

#[derive(Debug, Parser)]
#[command(
    name = "debussy",
    version,
    about = "Multi-agent pipeline watcher for coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the tmux session (conductor, board, watcher) and attach
    Start {
        /// Initial requirement handed to the conductor
        requirement: Option<String>,
    },
    /// Run the watcher loop
    Watch,
    /// Show runtime status (agents, branches, feature progress)
    Status,
    /// Render the pipeline board
    Board,
    /// Show pipeline metrics from the event log
    Metrics,
    /// Audit pipeline completeness for an acceptance bead's dependencies
    Audit {
        /// Bead id, e.g. bd-017
        bead: String,
    },
    /// View or set configuration
    Config {
        key: Option<String>,
        value: Option<String>,
    },
    /// Pause pipeline scanning (running agents keep draining)
    Pause,
    /// Resume pipeline scanning
    Resume,
    /// Initialize the tracker database
    Init,
    /// Back up the tracker database
    Backup,
    /// Back up, then wipe tracker and watcher state and re-init
    Clear,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Watch => "watch",
            Self::Status => "status",
            Self::Board => "board",
            Self::Metrics => "metrics",
            Self::Audit { .. } => "audit",
            Self::Config { .. } => "config",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Init => "init",
            Self::Backup => "backup",
            Self::Clear => "clear",
        }
    }
}

fn main() -> ExitCode {
    telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Start { requirement } => commands::start::run(requirement.as_deref()),
        Commands::Watch => Watcher::new().run(),
        Commands::Status => {
            commands::status::run();
            Ok(())
        }
        Commands::Board => {
            commands::board::run();
            Ok(())
        }
        Commands::Metrics => {
            commands::metrics::run();
            Ok(())
        }
        Commands::Audit { bead } => commands::audit::run(&bead),
        Commands::Config { key, value } => {
            commands::config::run(key.as_deref(), value.as_deref())
        }
        Commands::Pause => commands::config::pause(),
        Commands::Resume => commands::config::resume(),
        Commands::Init => commands::maintenance::init(),
        Commands::Backup => commands::maintenance::backup().map(|_| ()),
        Commands::Clear => commands::maintenance::clear(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
