use crate::chat::ThinkType;
use directories::BaseDirs;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MODEL: &str = "doubao-seed-1-6-250615";

pub const BASE_URL_ENV: &str = "WOODCHAT_BASE_URL";
pub const TIMEOUT_ENV: &str = "WOODCHAT_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub default_model: String,
    pub think_type: ThinkType,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            default_model: DEFAULT_MODEL.to_string(),
            think_type: ThinkType::default(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Invalid(detail) => {
                format!("Woodchat is misconfigured: {detail}. Fix woodchat.yaml.")
            }
        }
    }
}

impl ClientSettings {
    /// Defaults, overlaid with `woodchat.yaml` if one exists, overlaid with the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let file = match locate_config_file() {
            Some(path) => read_config_file(&path)?,
            None => WoodchatConfig::default(),
        };
        let overrides = EnvOverrides {
            base_url: env::var(BASE_URL_ENV).ok(),
            timeout_ms: env::var(TIMEOUT_ENV).ok(),
        };
        resolve_settings(file.client.unwrap_or_default(), overrides)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = read_config_file(path)?;
        resolve_settings(file.client.unwrap_or_default(), EnvOverrides::default())
    }
}

fn read_config_file(path: &Path) -> Result<WoodchatConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
    })?;
    if contents.trim().is_empty() {
        return Ok(WoodchatConfig::default());
    }
    serde_yaml::from_str(&contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid woodchat.yaml: {err}")))
}

#[derive(Debug, Default)]
struct EnvOverrides {
    base_url: Option<String>,
    timeout_ms: Option<String>,
}

fn resolve_settings(
    section: ClientSection,
    overrides: EnvOverrides,
) -> Result<ClientSettings, ConfigError> {
    let defaults = ClientSettings::default();

    let base_url = overrides
        .base_url
        .or(section.base_url)
        .map(|url| url.trim().trim_end_matches('/').to_string())
        .unwrap_or(defaults.base_url);
    if base_url.is_empty() {
        return Err(ConfigError::Invalid("base_url is empty".to_string()));
    }

    let timeout_ms = match overrides.timeout_ms {
        Some(raw) => Some(raw.trim().parse::<u64>().map_err(|_| {
            ConfigError::Invalid(format!("{TIMEOUT_ENV} must be milliseconds, got `{raw}`"))
        })?),
        None => section.timeout_ms,
    };
    let timeout = match timeout_ms {
        Some(0) => return Err(ConfigError::Invalid("timeout_ms must be positive".to_string())),
        Some(ms) => Duration::from_millis(ms),
        None => defaults.timeout,
    };

    let default_model = section
        .default_model
        .map(|model| model.trim().to_string())
        .filter(|model| !model.is_empty())
        .unwrap_or(defaults.default_model);

    let think_type = match section.think_type {
        Some(raw) => raw.parse().map_err(ConfigError::Invalid)?,
        None => defaults.think_type,
    };

    Ok(ClientSettings {
        base_url,
        timeout,
        default_model,
        think_type,
    })
}

fn locate_config_file() -> Option<PathBuf> {
    woodchat_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn woodchat_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("woodchat");
        paths.push(config_dir.join("woodchat.yaml"));
        paths.push(config_dir.join("woodchat.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".woodchat").join("woodchat.yaml"));
        paths.push(home_dir.join(".woodchat").join("woodchat.yml"));
    } else {
        paths.push(PathBuf::from("woodchat.yaml"));
        paths.push(PathBuf::from("woodchat.yml"));
    }
    paths
}

#[derive(Debug, Default, Deserialize)]
struct WoodchatConfig {
    client: Option<ClientSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ClientSection {
    base_url: Option<String>,
    timeout_ms: Option<u64>,
    default_model: Option<String>,
    think_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_section_resolves_to_defaults() {
        let settings =
            resolve_settings(ClientSection::default(), EnvOverrides::default()).expect("defaults");
        assert_eq!(settings, ClientSettings::default());
        assert_eq!(settings.timeout, Duration::from_secs(10));
    }

    #[test]
    fn environment_overrides_the_file() {
        let section = ClientSection {
            base_url: Some("https://chat.example.com/".into()),
            timeout_ms: Some(2_000),
            default_model: Some("deepseek".into()),
            think_type: Some("auto".into()),
        };
        let overrides = EnvOverrides {
            base_url: Some("http://localhost:9000".into()),
            timeout_ms: Some("500".into()),
        };
        let settings = resolve_settings(section, overrides).expect("settings");
        assert_eq!(settings.base_url, "http://localhost:9000");
        assert_eq!(settings.timeout, Duration::from_millis(500));
        assert_eq!(settings.default_model, "deepseek");
        assert_eq!(settings.think_type, ThinkType::Auto);
    }

    #[test]
    fn rejects_bad_values() {
        let overrides = EnvOverrides {
            base_url: None,
            timeout_ms: Some("soon".into()),
        };
        let err = resolve_settings(ClientSection::default(), overrides).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.user_message().starts_with("Woodchat is misconfigured: "));
        assert!(err.user_message().ends_with(". Fix woodchat.yaml."));

        let section = ClientSection {
            think_type: Some("sometimes".into()),
            ..ClientSection::default()
        };
        assert!(resolve_settings(section, EnvOverrides::default()).is_err());
    }

    #[test]
    fn reads_yaml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("woodchat.yaml");
        fs::write(
            &path,
            "client:\n  base_url: https://chat.example.com/\n  timeout_ms: 1500\n",
        )
        .expect("write");
        let settings = ClientSettings::from_file(&path).expect("settings");
        assert_eq!(settings.base_url, "https://chat.example.com");
        assert_eq!(settings.timeout, Duration::from_millis(1500));

        fs::write(&path, "client: [not, a, map]\n").expect("write");
        assert!(matches!(
            ClientSettings::from_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
