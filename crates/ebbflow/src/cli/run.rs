//! `ebbflow run`: extract sources, then optionally trigger downstream.

use anyhow::{bail, Context, Result};
use clap::Args;
use comfy_table::Color;
use ebbflow_extract::{HttpConfig, PageSource, ReqwestPageSource, SourceDefinition};
use ebbflow_state_store::open_state_store;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info};

use crate::cli::config::ResolvedConfig;
use crate::cli::error::HelpfulError;
use crate::cli::output::{print_table_colored, status_color};
use crate::runner::{KeyBounds, Runner, SourceReport};

/// Arguments for the run command
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Sources to run (default: all configured sources)
    pub sources: Vec<String>,

    /// Run every configured source
    #[arg(long, conflicts_with = "sources")]
    pub all: bool,

    /// Maximum partitions fetched at once (overrides the config file)
    #[arg(long, short = 'c')]
    pub concurrency: Option<usize>,

    /// First key to request, e.g. 2024-01-01 or 1
    #[arg(long)]
    pub start: Option<String>,

    /// Last key to request
    #[arg(long)]
    pub end: Option<String>,

    /// Shell command to run after each source whose outcome triggers downstream
    #[arg(long, value_name = "CMD")]
    pub then: Option<String>,

    /// Print run reports as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    fn bounds(&self) -> KeyBounds {
        KeyBounds {
            start: self.start.clone(),
            end: self.end.clone(),
        }
    }
}

fn select_sources<'a>(args: &RunArgs, config: &'a ResolvedConfig) -> Result<Vec<&'a SourceDefinition>> {
    if args.all || args.sources.is_empty() {
        return Ok(config.sources.iter().collect());
    }
    args.sources.iter().map(|name| config.source(name)).collect()
}

pub fn run(args: RunArgs, config: &ResolvedConfig) -> Result<()> {
    let concurrency = args.concurrency.unwrap_or(config.concurrency);
    if concurrency == 0 {
        bail!(HelpfulError::new("--concurrency must be at least 1"));
    }
    let sources = select_sources(&args, config)?;
    let pages = page_source(&config.http)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run_sources(&args, config, &sources, concurrency, pages))
}

fn page_source(http: &HttpConfig) -> Result<Arc<dyn PageSource>> {
    let source = ReqwestPageSource::new(http.clone()).context("Failed to create HTTP client")?;
    Ok(Arc::new(source))
}

async fn run_sources(
    args: &RunArgs,
    config: &ResolvedConfig,
    sources: &[&SourceDefinition],
    concurrency: usize,
    pages: Arc<dyn PageSource>,
) -> Result<()> {
    let store = open_state_store(&config.state_store)
        .await
        .with_context(|| format!("Failed to open state store {}", config.state_store))?;
    let runner = Runner::new(&config.sink_path, concurrency, pages, store.as_ref());
    let bounds = args.bounds();

    let mut reports = Vec::new();
    let mut aborted = Vec::new();
    for source in sources {
        let report = match runner.run_source(source, &bounds).await {
            Ok(report) => report,
            Err(err) => {
                error!("{} aborted: {:#}", source.name, err);
                if !args.json {
                    eprintln!("{}: run aborted\n{:#}", source.name, err);
                }
                aborted.push(source.name.clone());
                continue;
            }
        };

        if !args.json {
            print_report(&report);
        }
        if let Some(command) = &args.then {
            if report.summary.triggers_downstream {
                run_hook(command, &report).await?;
            } else {
                info!("{}: {} does not trigger downstream", report.source, report.summary.outcome);
            }
        }
        reports.push(report);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }

    if !aborted.is_empty() {
        bail!(HelpfulError::new(format!(
            "{} of {} sources aborted: {}",
            aborted.len(),
            sources.len(),
            aborted.join(", ")
        ))
        .with_context("Merges committed before the abort are kept; a rerun fetches the rest")
        .with_suggestion(format!(
            "TRY: Check the log under {}",
            ebbflow_protocol::paths::default_logs_dir().display()
        )));
    }
    Ok(())
}

/// Run `command` through `sh -c` with the run outcome in the environment.
pub async fn run_hook(command: &str, report: &SourceReport) -> Result<()> {
    info!("{}: running downstream command: {}", report.source, command);
    let status = Command::new("sh")
        .arg("-c")
        .arg(command)
        .env("EBBFLOW_SOURCE", &report.source)
        .env("EBBFLOW_TABLE", &report.table)
        .env("EBBFLOW_OUTCOME", report.summary.outcome.as_str())
        .env("EBBFLOW_SUCCESS_COUNT", report.summary.success.to_string())
        .status()
        .await
        .with_context(|| format!("Failed to start downstream command: {}", command))?;

    if !status.success() {
        return Err(HelpfulError::hook_failed(command, &status.to_string()).into());
    }
    Ok(())
}

fn print_report(report: &SourceReport) {
    println!();
    println!(
        "{} -> {} ({} rows written)",
        report.source, report.table, report.rows_written
    );

    let rows = report
        .partitions
        .iter()
        .map(|p| {
            vec![
                (p.partition.clone(), None),
                (p.status.to_string(), status_color(p.status)),
                (
                    p.fetched
                        .as_ref()
                        .map(|span| span.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    None,
                ),
                (p.error.clone().unwrap_or_default(), Some(Color::Red)),
            ]
        })
        .collect();
    print_table_colored(&["Partition", "Status", "Fetched", "Error"], rows);
    println!("{}", report.summary);
}
