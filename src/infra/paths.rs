// src/infra/paths.rs — XDG-compliant path management
//
// All paths respect the GENTASK_HOME environment variable for isolation.
// When GENTASK_HOME is set, config and data live under that directory.
// When unset, config uses the XDG config dir and data uses XDG_DATA_HOME/gentask.

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "gentask")
}

/// Returns the GENTASK_HOME override, if set.
fn gentask_home() -> Option<PathBuf> {
    std::env::var_os("GENTASK_HOME").map(PathBuf::from)
}

/// Configuration directory: $GENTASK_HOME/ or ~/.config/gentask/
pub fn config_dir() -> PathBuf {
    if let Some(home) = gentask_home() {
        return home;
    }
    project_dirs()
        .map(|d| d.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".gentask"))
}

/// Data directory: $GENTASK_HOME/data/ or ~/.local/share/gentask/
pub fn data_dir() -> PathBuf {
    if let Some(home) = gentask_home() {
        return home.join("data");
    }
    project_dirs()
        .map(|d| d.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".gentask").join("data"))
}

/// Database path
pub fn db_path() -> PathBuf {
    data_dir().join("gentask.db")
}

/// Default root for locally stored results
pub fn objects_dir() -> PathBuf {
    data_dir().join("objects")
}

/// Config file path
pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Ensure all required directories exist
pub async fn ensure_dirs() -> anyhow::Result<()> {
    for dir in [config_dir(), data_dir(), objects_dir()] {
        tokio::fs::create_dir_all(&dir).await?;
    }
    Ok(())
}
