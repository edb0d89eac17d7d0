//! Configuration file and resolved paths.
//!
//! Everything lives under `$EBBFLOW_HOME` (default `~/.ebbflow/`) unless the
//! config file or a flag says otherwise:
//!
//! ```toml
//! sink = "/data/warehouse.duckdb"
//! state_store = "sqlite:/data/state.sqlite"
//! concurrency = 5
//!
//! [http]
//! timeout_secs = 30
//! max_attempts = 3
//! backoff_ms = 500
//!
//! [[sources]]
//! preset = "open_meteo"
//!
//! [[sources]]
//! name = "my_api"
//! url = "https://api.example.com/{partition}"
//! # ...the rest of a source definition
//! ```
//!
//! With no `[[sources]]` entries every built-in preset is available.

use anyhow::{bail, Context, Result};
use ebbflow_extract::{presets, HttpConfig, SourceDefinition, DEFAULT_CONCURRENCY};
use ebbflow_protocol::paths::{
    default_config_path, default_logs_dir, default_sink_path, default_state_store_path,
    ebbflow_home,
};
use ebbflow_state_store::StateStoreUrl;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::cli::error::HelpfulError;

/// One `[[sources]]` entry: a built-in preset or a full definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SourceEntry {
    Preset {
        preset: String,
        /// Rename the preset, e.g. to run it twice against different tables.
        #[serde(default)]
        name: Option<String>,
    },
    Definition(Box<SourceDefinition>),
}

impl SourceEntry {
    fn resolve(self) -> Result<SourceDefinition> {
        match self {
            SourceEntry::Preset { preset, name } => {
                let mut source = presets::preset(&preset).ok_or_else(|| {
                    HelpfulError::new(format!("Unknown preset: {}", preset)).with_suggestion(
                        format!("TRY: Use one of: {}", presets::preset_names().join(", ")),
                    )
                })?;
                if let Some(name) = name {
                    source.name = name;
                }
                Ok(source)
            }
            SourceEntry::Definition(source) => Ok(*source),
        }
    }
}

/// Raw contents of `ebbflow.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EbbflowConfig {
    #[serde(default)]
    pub sink: Option<PathBuf>,
    #[serde(default)]
    pub state_store: Option<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

impl EbbflowConfig {
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Invalid configuration")
    }
}

/// Flag and environment overrides, highest priority.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub sink: Option<PathBuf>,
    pub state_store: Option<String>,
}

/// Configuration after defaults, file, and overrides are applied.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config_path: PathBuf,
    pub config_found: bool,
    pub sink_path: PathBuf,
    pub state_store: StateStoreUrl,
    pub concurrency: usize,
    pub http: HttpConfig,
    pub sources: Vec<SourceDefinition>,
}

impl ResolvedConfig {
    pub fn load(overrides: &Overrides) -> Result<Self> {
        let (config_path, explicit) = match &overrides.config {
            Some(path) => (path.clone(), true),
            None => (default_config_path(), false),
        };

        let file = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Some(
                EbbflowConfig::parse(&raw)
                    .with_context(|| format!("In config file {}", config_path.display()))?,
            )
        } else if explicit {
            return Err(HelpfulError::new(format!(
                "Config file not found: {}",
                config_path.display()
            ))
            .with_suggestion("TRY: Check the --config path or unset EBBFLOW_CONFIG")
            .into());
        } else {
            None
        };

        let config_found = file.is_some();
        Self::from_parts(config_path, config_found, file.unwrap_or_default(), overrides)
    }

    pub fn from_parts(
        config_path: PathBuf,
        config_found: bool,
        file: EbbflowConfig,
        overrides: &Overrides,
    ) -> Result<Self> {
        let sink_path = overrides
            .sink
            .clone()
            .or(file.sink)
            .unwrap_or_else(default_sink_path);

        let state_store = match overrides.state_store.as_ref().or(file.state_store.as_ref()) {
            Some(raw) => StateStoreUrl::parse(raw)?,
            None => StateStoreUrl::sqlite(default_state_store_path()),
        };

        let concurrency = file.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            bail!("concurrency must be at least 1");
        }

        let sources = if file.sources.is_empty() {
            presets::all_presets()
        } else {
            file.sources
                .into_iter()
                .map(SourceEntry::resolve)
                .collect::<Result<Vec<_>>>()?
        };

        let mut names = BTreeSet::new();
        for source in &sources {
            source.validate()?;
            if !names.insert(source.name.as_str()) {
                bail!("Source '{}' is configured twice", source.name);
            }
        }

        Ok(Self {
            config_path,
            config_found,
            sink_path,
            state_store,
            concurrency,
            http: file.http,
            sources,
        })
    }

    pub fn source(&self, name: &str) -> Result<&SourceDefinition> {
        self.sources.iter().find(|s| s.name == name).ok_or_else(|| {
            HelpfulError::new(format!("Unknown source: {}", name))
                .with_suggestion(format!(
                    "TRY: Configured sources are: {}",
                    self.source_names().join(", ")
                ))
                .with_suggestion("TRY: List them with: ebbflow sources")
                .into()
        })
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Arguments for the config command
#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    /// Show resolved paths in JSON format
    #[arg(long)]
    pub json: bool,
}

fn exists_label(path: &Path) -> &'static str {
    if path.exists() {
        "exists"
    } else {
        "not found"
    }
}

/// Run the config command - shows resolved paths and settings
pub fn run(args: ConfigArgs, config: &ResolvedConfig) -> Result<()> {
    let home = ebbflow_home();
    let logs = default_logs_dir();
    let state_path = match &config.state_store {
        StateStoreUrl::Sqlite(path) => Some(path.clone()),
        StateStoreUrl::Memory => None,
    };

    if args.json {
        let value = serde_json::json!({
            "home": home.to_string_lossy(),
            "config": {
                "path": config.config_path.to_string_lossy(),
                "exists": config.config_found,
            },
            "sink": {
                "backend": "duckdb",
                "path": config.sink_path.to_string_lossy(),
                "exists": config.sink_path.exists(),
            },
            "state_store": {
                "url": config.state_store.to_string(),
                "exists": state_path.as_ref().map(|p| p.exists()),
            },
            "logs": logs.to_string_lossy(),
            "concurrency": config.concurrency,
            "http": config.http,
            "sources": config.source_names(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("EBBFLOW CONFIGURATION");
    println!("=====================");
    println!();
    println!("Home:        {}", home.display());
    println!(
        "Config:      {} ({})",
        config.config_path.display(),
        if config.config_found { "loaded" } else { "not found, using defaults" }
    );
    println!();
    println!(
        "Sink:        {} ({})",
        config.sink_path.display(),
        exists_label(&config.sink_path)
    );
    match &state_path {
        Some(path) => println!("State store: {} ({})", config.state_store, exists_label(path)),
        None => println!("State store: {}", config.state_store),
    }
    println!("Logs:        {}", logs.display());
    println!();
    println!("Concurrency: {}", config.concurrency);
    println!(
        "HTTP:        timeout {}s, {} attempts, {}ms backoff",
        config.http.timeout_secs, config.http.max_attempts, config.http.backoff_ms
    );
    println!("Sources:     {}", config.source_names().join(", "));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebbflow_protocol::KeyKind;

    const CONFIG: &str = r#"
        sink = "/tmp/ebbflow-test/warehouse.duckdb"
        state_store = "memory"
        concurrency = 3

        [http]
        max_attempts = 5

        [[sources]]
        preset = "rick_and_morty"

        [[sources]]
        preset = "open_meteo"
        name = "weather"

        [[sources]]
        name = "launches"
        url = "https://api.example.com/launches/{partition}"
        key_kind = "integer"
        key_field = "flight_number"
        table = "launches"
        chunk_span = { width = 50 }
        layout = { type = "nested", pointer = "/docs" }
        pagination = { next_pointer = "/next" }
        partitions = [{ id = "past" }, { id = "upcoming" }]
        range = { start = 1, end = 500 }
    "#;

    #[test]
    fn test_parse_presets_and_definitions() {
        let file = EbbflowConfig::parse(CONFIG).unwrap();
        let config = ResolvedConfig::from_parts(
            PathBuf::from("ebbflow.toml"),
            true,
            file,
            &Overrides::default(),
        )
        .unwrap();

        assert_eq!(config.source_names(), vec!["rick_and_morty", "weather", "launches"]);
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.http.max_attempts, 5);
        assert_eq!(config.http.timeout_secs, 30);
        assert_eq!(config.state_store, StateStoreUrl::Memory);

        let launches = config.source("launches").unwrap();
        assert_eq!(launches.key_kind, KeyKind::Integer);
        assert_eq!(launches.partition_column, "partition");
        assert_eq!(launches.pagination.as_ref().unwrap().max_pages, 1000);
        assert_eq!(config.source("weather").unwrap().table, "daily_weather");
        assert!(config.source("nope").is_err());
    }

    #[test]
    fn test_overrides_win() {
        let file = EbbflowConfig::parse(CONFIG).unwrap();
        let overrides = Overrides {
            config: None,
            sink: Some(PathBuf::from("/elsewhere/w.duckdb")),
            state_store: Some("sqlite:/elsewhere/state.sqlite".to_string()),
        };
        let config =
            ResolvedConfig::from_parts(PathBuf::from("x.toml"), true, file, &overrides).unwrap();
        assert_eq!(config.sink_path, PathBuf::from("/elsewhere/w.duckdb"));
        assert_eq!(
            config.state_store,
            StateStoreUrl::sqlite("/elsewhere/state.sqlite")
        );
    }

    #[test]
    fn test_empty_config_uses_presets() {
        let config = ResolvedConfig::from_parts(
            PathBuf::from("missing.toml"),
            false,
            EbbflowConfig::default(),
            &Overrides {
                state_store: Some("memory".to_string()),
                sink: Some(PathBuf::from("/tmp/w.duckdb")),
                config: None,
            },
        )
        .unwrap();
        assert_eq!(config.source_names(), vec!["open_meteo", "rick_and_morty"]);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
    }

    #[test]
    fn test_rejects_bad_configs() {
        let duplicate = EbbflowConfig::parse(
            r#"
            [[sources]]
            preset = "open_meteo"
            [[sources]]
            preset = "open_meteo"
            "#,
        )
        .unwrap();
        let err = ResolvedConfig::from_parts(
            PathBuf::from("x.toml"),
            true,
            duplicate,
            &Overrides::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("configured twice"));

        let unknown = EbbflowConfig::parse("[[sources]]\npreset = \"nope\"\n").unwrap();
        assert!(ResolvedConfig::from_parts(
            PathBuf::from("x.toml"),
            true,
            unknown,
            &Overrides::default()
        )
        .is_err());

        assert!(EbbflowConfig::parse("colour = \"blue\"").is_err());
    }

    #[test]
    fn test_explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = Overrides {
            config: Some(dir.path().join("nope.toml")),
            ..Overrides::default()
        };
        let err = ResolvedConfig::load(&overrides).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ebbflow.toml");
        std::fs::write(
            &path,
            format!(
                "sink = \"{}\"\nstate_store = \"memory\"\n[[sources]]\npreset = \"rick_and_morty\"\n",
                dir.path().join("w.duckdb").display()
            ),
        )
        .unwrap();

        let config = ResolvedConfig::load(&Overrides {
            config: Some(path),
            ..Overrides::default()
        })
        .unwrap();
        assert!(config.config_found);
        assert_eq!(config.source_names(), vec!["rick_and_morty"]);
    }
}
