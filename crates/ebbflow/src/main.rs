//! ebbflow: incremental extraction from paginated HTTP APIs into DuckDB.
//!
//! Each `run` reads what the warehouse already holds per partition, fetches
//! only the missing key ranges, merges them idempotently and records the
//! outcome. A `--then` command runs afterwards when the outcome says there
//! is something new downstream.

use anyhow::Result;
use clap::{Parser, Subcommand};
use ebbflow_logging::{init_logging, LogConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;

mod cli;
mod runner;

use cli::config::{Overrides, ResolvedConfig};

#[derive(Parser, Debug)]
#[command(name = "ebbflow", version, about = "Incremental API extraction into DuckDB")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Config file (default: $EBBFLOW_HOME/ebbflow.toml)
    #[arg(long, global = true, env = "EBBFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// DuckDB warehouse file (overrides the config file)
    #[arg(long, global = true, env = "EBBFLOW_SINK")]
    sink: Option<PathBuf>,

    /// State store URL, `sqlite:<path>` or `memory` (overrides the config file)
    #[arg(long, global = true, env = "EBBFLOW_STATE_STORE")]
    state_store: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch missing ranges for one or more sources
    Run(cli::run::RunArgs),

    /// Show watermarks and the chunk plan without fetching
    Plan(cli::plan::PlanArgs),

    /// Show the saved state of a source's last run
    State(cli::state::StateArgs),

    /// List configured sources
    Sources(cli::sources::SourcesArgs),

    /// Show resolved paths and settings
    Config(cli::config::ConfigArgs),
}

fn command_wants_json(command: &Commands) -> bool {
    match command {
        Commands::Run(args) => args.json,
        Commands::Plan(args) => args.json,
        Commands::State(args) => args.json,
        Commands::Sources(args) => args.json,
        Commands::Config(args) => args.json,
    }
}

fn run_command(cli: Cli) -> Result<()> {
    let overrides = Overrides {
        config: cli.config,
        sink: cli.sink,
        state_store: cli.state_store,
    };
    let config = ResolvedConfig::load(&overrides)?;
    debug!(
        "Loaded config from {} (found: {})",
        config.config_path.display(),
        config.config_found
    );

    match cli.command {
        Commands::Run(args) => cli::run::run(args, &config),
        Commands::Plan(args) => cli::plan::run(args, &config),
        Commands::State(args) => cli::state::run(args, &config),
        Commands::Sources(args) => cli::sources::run(args, &config),
        Commands::Config(args) => cli::config::run(args, &config),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let json_mode = command_wants_json(&cli.command);

    if let Err(err) = init_logging(LogConfig {
        app_name: "ebbflow",
        verbose: cli.verbose,
        log_dir: None,
    }) {
        eprintln!("Warning: failed to initialize logging: {:#}", err);
    }

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if json_mode {
                cli::error::print_json_error(&err);
            } else {
                eprintln!("{:?}", err);
            }
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_arguments() {
        let cli = Cli::try_parse_from([
            "ebbflow",
            "run",
            "open_meteo",
            "--start",
            "2024-01-01",
            "--then",
            "dbt build",
            "--json",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(command_wants_json(&cli.command));
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.sources, vec!["open_meteo"]);
                assert_eq!(args.start.as_deref(), Some("2024-01-01"));
                assert_eq!(args.then.as_deref(), Some("dbt build"));
                assert!(!args.all);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_all_conflicts_with_named_sources() {
        assert!(Cli::try_parse_from(["ebbflow", "run", "--all", "open_meteo"]).is_err());
    }
}
