use std::path::{Path, PathBuf};
use std::sync::Once;

static CREATE_DIR_WARNED: Once = Once::new();

/// Resolve the Ebbflow home directory.
///
/// Priority:
/// 1) EBBFLOW_HOME
/// 2) HOME/USERPROFILE
/// 3) ./.ebbflow
pub fn ebbflow_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("EBBFLOW_HOME") {
        return PathBuf::from(override_path);
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        return PathBuf::from(home).join(".ebbflow");
    }
    PathBuf::from(".").join(".ebbflow")
}

fn ensure_home_dir(home: &Path) {
    if let Err(err) = std::fs::create_dir_all(home) {
        CREATE_DIR_WARNED.call_once(|| {
            eprintln!(
                "Warning: failed to create Ebbflow home directory {}: {}. Set EBBFLOW_HOME or pass explicit paths.",
                home.display(),
                err
            );
        });
    }
}

/// Default config file: ~/.ebbflow/ebbflow.toml
pub fn default_config_path() -> PathBuf {
    ebbflow_home().join("ebbflow.toml")
}

/// Default state store path: ~/.ebbflow/state.sqlite
pub fn default_state_store_path() -> PathBuf {
    let home = ebbflow_home();
    ensure_home_dir(&home);
    home.join("state.sqlite")
}

/// Default sink path: ~/.ebbflow/warehouse.duckdb
pub fn default_sink_path() -> PathBuf {
    let home = ebbflow_home();
    ensure_home_dir(&home);
    home.join("warehouse.duckdb")
}

/// Default logs directory: ~/.ebbflow/logs
pub fn default_logs_dir() -> PathBuf {
    let home = ebbflow_home();
    ensure_home_dir(&home);
    home.join("logs")
}
