//! `ebbflow sources`: list configured sources.

use anyhow::Result;
use clap::Args;
use ebbflow_extract::{RequestTemplate, SourceDefinition};
use ebbflow_protocol::ChunkSpan;

use crate::cli::config::ResolvedConfig;
use crate::cli::output::print_table;

/// Arguments for the sources command
#[derive(Debug, Args)]
pub struct SourcesArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: SourcesArgs, config: &ResolvedConfig) -> Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(&config.sources)?);
        return Ok(());
    }

    let rows = config.sources.iter().map(source_row).collect();
    print_table(
        &["Source", "Key", "Table", "Partitions", "Chunks", "Range", "URL"],
        rows,
    );
    Ok(())
}

fn source_row(source: &SourceDefinition) -> Vec<String> {
    vec![
        source.name.clone(),
        format!("{} ({})", source.key_field, source.key_kind.as_str()),
        source.table.clone(),
        source.partitions.len().to_string(),
        chunk_label(source),
        range_label(source),
        source.url.clone(),
    ]
}

fn chunk_label(source: &SourceDefinition) -> String {
    let span = match source.chunk_span {
        ChunkSpan::CalendarYear => "yearly".to_string(),
        ChunkSpan::Width(0) => "unbounded".to_string(),
        ChunkSpan::Width(n) => format!("{} keys", n),
    };
    match source.request {
        RequestTemplate::IdList => format!("{}, id list", span),
        _ => span,
    }
}

fn range_label(source: &SourceDefinition) -> String {
    if let Some(probe) = &source.count_probe {
        return format!("1..=count at {}", probe.pointer);
    }
    match &source.range {
        Some(range) => format!(
            "{}..={}",
            serde_json::to_string(&range.start).unwrap_or_default(),
            serde_json::to_string(&range.end).unwrap_or_default()
        ),
        None => "-".to_string(),
    }
}
