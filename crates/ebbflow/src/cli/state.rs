//! `ebbflow state`: show the persisted state of the last run.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Args;
use ebbflow_extract::SourceDefinition;
use ebbflow_protocol::{KeyKind, OrderedKey};
use ebbflow_state_store::{load_run_state, open_state_store, StateStore};

use crate::cli::config::ResolvedConfig;
use crate::cli::error::HelpfulError;
use crate::cli::output::{format_timestamp, print_table_colored, status_color};
use crate::runner::SourceReport;

/// Arguments for the state command
#[derive(Debug, Args)]
pub struct StateArgs {
    /// Source whose state to show
    pub source: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: StateArgs, config: &ResolvedConfig) -> Result<()> {
    let source = config.source(&args.source)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let loaded = runtime.block_on(async {
        let store = open_state_store(&config.state_store)
            .await
            .with_context(|| format!("Failed to open state store {}", config.state_store))?;
        load_report(store.as_ref(), source).await
    })?;

    let Some(loaded) = loaded else {
        return Err(HelpfulError::new(format!("No saved state for '{}'", source.name))
            .with_context(format!("State store: {}", config.state_store))
            .with_suggestion(format!("TRY: Run it first: ebbflow run {}", source.name))
            .into());
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&loaded)?);
        return Ok(());
    }

    let report = &loaded.report;
    println!("{} ({})", report.source, report.table);
    println!("Started:  {}", format_timestamp(Some(loaded.started_at)));
    println!("Finished: {}", format_timestamp(loaded.finished_at));
    println!(
        "Last run: {}",
        report
            .last_run_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unfinished".to_string())
    );
    if let Some(observed) = &report.observed {
        println!("Observed: {}", observed);
    }
    println!();

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
                        .map(|f| f.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    None,
                ),
                (p.error.clone().unwrap_or_default(), None),
            ]
        })
        .collect();
    print_table_colored(&["Partition", "Status", "Fetched", "Error"], rows);
    println!("{}", report.summary);
    Ok(())
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LoadedState {
    #[serde(flatten)]
    pub report: SourceReport,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Decode the saved state with the source's key type.
pub async fn load_report(
    store: &dyn StateStore,
    source: &SourceDefinition,
) -> Result<Option<LoadedState>> {
    match source.key_kind {
        KeyKind::Date => load_typed::<NaiveDate>(store, source).await,
        KeyKind::Integer => load_typed::<i64>(store, source).await,
    }
}

async fn load_typed<K: OrderedKey>(
    store: &dyn StateStore,
    source: &SourceDefinition,
) -> Result<Option<LoadedState>> {
    let Some(state) = load_run_state::<K>(store, &source.name).await? else {
        return Ok(None);
    };
    Ok(Some(LoadedState {
        report: SourceReport::from_state(source, &state, 0),
        started_at: state.started_at,
        finished_at: state.finished_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebbflow_extract::presets;
    use ebbflow_protocol::{FetchRange, LastRunStatus, PartitionStatus, RunState};
    use ebbflow_state_store::{save_run_state, MemoryStateStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_load_report_decodes_by_key_kind() {
        let store = MemoryStateStore::new();
        let source = presets::rick_and_morty();
        let mut state = RunState::<i64>::new();
        state.mark_success("character", FetchRange::new(1, 826).unwrap());
        state.mark_failed("episode", "HTTP 500 from upstream");
        state.mark_skipped("location");
        state.finalize();
        save_run_state(&store, &source.name, &state).await.unwrap();

        let loaded = load_report(&store, &source).await.unwrap().unwrap();
        assert_eq!(loaded.report.last_run_status, Some(LastRunStatus::Success));
        assert_eq!(loaded.report.summary.success, 1);
        assert_eq!(loaded.report.partitions.len(), 3);
        let episode = &loaded.report.partitions[1];
        assert_eq!(episode.partition, "episode");
        assert_eq!(episode.status, PartitionStatus::Failed);
        assert_eq!(episode.error.as_deref(), Some("HTTP 500 from upstream"));

        let value = serde_json::to_value(&loaded).unwrap();
        assert_eq!(value["observed"], json!({ "start": 1, "end": 826 }));
        assert!(value["finished_at"].is_string());
    }

    #[tokio::test]
    async fn test_missing_state_is_none() {
        let store = MemoryStateStore::new();
        let loaded = load_report(&store, &presets::open_meteo()).await.unwrap();
        assert!(loaded.is_none());
    }
}
