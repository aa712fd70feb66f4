use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CLI_STATE_FILE: &str = "cli_state.json";

/// What the CLI remembers between invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliState {
    #[serde(default)]
    pub last_session: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
}

pub fn state_root() -> PathBuf {
    match BaseDirs::new() {
        Some(base) => base.config_dir().join("woodchat"),
        None => PathBuf::from(".woodchat"),
    }
}

pub fn cli_state_path(root: &Path) -> PathBuf {
    root.join(CLI_STATE_FILE)
}

/// Missing or unreadable state falls back to defaults; a corrupt file is overwritten.
pub async fn load_cli_state(root: &Path) -> Result<CliState> {
    let path = cli_state_path(root);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(state) => Ok(state),
            Err(err) => {
                warn!(error = ?err, "failed to parse cli_state.json, resetting to defaults");
                let defaults = CliState::default();
                save_cli_state(root, &defaults).await?;
                Ok(defaults)
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(CliState::default()),
        Err(err) => Err(err).context("failed to read cli_state.json"),
    }
}

pub async fn save_cli_state(root: &Path, state: &CliState) -> Result<()> {
    tokio::fs::create_dir_all(root)
        .await
        .with_context(|| format!("failed to create directory {}", root.display()))?;
    let path = cli_state_path(root);
    let serialized = serde_json::to_string_pretty(state)?;
    tokio::fs::write(&path, serialized)
        .await
        .with_context(|| format!("failed to write cli_state.json at {}", path.display()))
}
