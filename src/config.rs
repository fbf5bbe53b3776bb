//! Configuration loaded from `md-outline.toml` with environment overrides.

use crate::backup::{DEFAULT_AUTOSAVE_INTERVAL, DEFAULT_EXPIRY};
use crate::doc::{CodecConfig, MAX_HEADING_DEPTH};
use crate::remote::DEFAULT_LABEL;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "md-outline.toml";
pub const DEFAULT_BASE_URL: &str = "https://cloud.langfuse.com";

pub const ENV_PUBLIC_KEY: &str = "LANGFUSE_PUBLIC_KEY";
pub const ENV_SECRET_KEY: &str = "LANGFUSE_SECRET_KEY";
pub const ENV_HOST: &str = "LANGFUSE_HOST";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub heading_start_level: u32,
    pub max_sections: usize,
    pub backup: BackupConfig,
    pub remote: RemoteConfig,
}

impl Default for Config {
    fn default() -> Self {
        let codec = CodecConfig::default();
        Self {
            heading_start_level: codec.heading_start_level,
            max_sections: codec.max_sections,
            backup: BackupConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub interval_ms: u64,
    pub expiry_days: u64,
    pub dir: Option<PathBuf>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_AUTOSAVE_INTERVAL.as_millis() as u64,
            expiry_days: DEFAULT_EXPIRY.as_secs() / (24 * 60 * 60),
            dir: None,
        }
    }
}

impl BackupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_days * 24 * 60 * 60)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub public_key: Option<String>,
    pub secret_key: Option<String>,
    pub default_label: String,
    /// Only documents whose name starts with this are listed.
    pub name_prefix: Option<String>,
    pub timeout_secs: u64,
    pub page_limit: u32,
    pub max_pages: u32,
    pub history_max_pages: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            public_key: None,
            secret_key: None,
            default_label: DEFAULT_LABEL.to_string(),
            name_prefix: None,
            timeout_secs: 30,
            page_limit: 50,
            max_pages: 20,
            history_max_pages: 10,
        }
    }
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("public_key", &self.public_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("default_label", &self.default_label)
            .field("name_prefix", &self.name_prefix)
            .field("timeout_secs", &self.timeout_secs)
            .field("page_limit", &self.page_limit)
            .field("max_pages", &self.max_pages)
            .field("history_max_pages", &self.history_max_pages)
            .finish()
    }
}

impl RemoteConfig {
    pub fn is_configured(&self) -> bool {
        let present = |key: &Option<String>| key.as_deref().is_some_and(|key| !key.is_empty());
        present(&self.public_key) && present(&self.secret_key)
    }
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads `path` if given, else `md-outline.toml` in the working directory
    /// when it exists, else defaults. Environment overrides apply last.
    pub fn discover(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => Self::load(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`. Empty values are ignored.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let value = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(public) = value(ENV_PUBLIC_KEY) {
            self.remote.public_key = Some(public);
        }
        if let Some(secret) = value(ENV_SECRET_KEY) {
            self.remote.secret_key = Some(secret);
        }
        if let Some(host) = value(ENV_HOST) {
            self.remote.base_url = host;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));
        if !(1..=MAX_HEADING_DEPTH as u32).contains(&self.heading_start_level) {
            return invalid(format!(
                "heading_start_level must be between 1 and {MAX_HEADING_DEPTH}, got {}",
                self.heading_start_level
            ));
        }
        if self.max_sections == 0 {
            return invalid("max_sections must be positive".into());
        }
        if self.backup.interval_ms == 0 {
            return invalid("backup.interval_ms must be positive".into());
        }
        if self.backup.expiry_days == 0 {
            return invalid("backup.expiry_days must be positive".into());
        }
        if self.remote.base_url.trim().is_empty() {
            return invalid("remote.base_url must not be empty".into());
        }
        if self.remote.page_limit == 0 || self.remote.max_pages == 0 || self.remote.history_max_pages == 0 {
            return invalid("remote page limits must be positive".into());
        }
        if self.remote.timeout_secs == 0 {
            return invalid("remote.timeout_secs must be positive".into());
        }
        Ok(())
    }

    pub fn codec(&self) -> CodecConfig {
        CodecConfig {
            heading_start_level: self.heading_start_level,
            max_sections: self.max_sections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.heading_start_level, 1);
        assert_eq!(config.max_sections, 10_000);
        assert_eq!(config.backup.interval(), Duration::from_millis(3000));
        assert_eq!(config.backup.expiry(), DEFAULT_EXPIRY);
        assert_eq!(config.remote.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.remote.default_label, "production");
        assert_eq!(
            (config.remote.page_limit, config.remote.max_pages, config.remote.history_max_pages),
            (50, 20, 10)
        );
        assert!(!config.remote.is_configured());
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
heading_start_level = 2

[backup]
dir = "/tmp/outline-backups"

[remote]
name_prefix = "notes/"
"#,
        )
        .unwrap();
        assert_eq!(config.codec().heading_start_level, 2);
        assert_eq!(config.backup.dir, Some(PathBuf::from("/tmp/outline-backups")));
        assert_eq!(config.backup.expiry_days, 7);
        assert_eq!(config.remote.name_prefix.as_deref(), Some("notes/"));
        assert_eq!(config.remote.timeout_secs, 30);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for contents in [
            "heading_start_level = 0",
            "heading_start_level = 7",
            "[backup]\ninterval_ms = 0",
            "[remote]\npage_limit = 0",
        ] {
            assert!(
                matches!(Config::from_toml_str(contents), Err(ConfigError::Invalid(_))),
                "accepted {contents:?}"
            );
        }
        assert!(matches!(
            Config::from_toml_str("heading_start_level = \"two\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_overrides_credentials_and_host() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_PUBLIC_KEY, "pk-1"),
            (ENV_SECRET_KEY, "sk-1"),
            (ENV_HOST, "  "),
        ]);
        let mut config = Config::default();
        config.apply_env_with(|key| env.get(key).map(|value| value.to_string()));
        assert!(config.remote.is_configured());
        assert_eq!(config.remote.public_key.as_deref(), Some("pk-1"));
        assert_eq!(config.remote.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn secret_is_redacted_in_debug_output() {
        let remote = RemoteConfig {
            secret_key: Some("sk-secret".into()),
            ..RemoteConfig::default()
        };
        assert!(!format!("{remote:?}").contains("sk-secret"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::load("/nonexistent/md-outline.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/md-outline.toml"));
    }
}
