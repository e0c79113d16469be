use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_RETRIES: u32 = 1;
const DEFAULT_SESSION_TTL_HOURS: u64 = 24;
const DEFAULT_VISIBILITY_THRESHOLD: f64 = 0.1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        path: String,
        source: serde_json::Error,
    },

    #[error("Invalid backend URL '{0}' (must be absolute)")]
    InvalidBackendUrl(String),

    #[error("Missing required setting: {0}")]
    MissingSetting(&'static str),

    #[error("Environment variable {name} has an invalid value: {value}")]
    InvalidEnvVar { name: String, value: String },
}

/// Client settings for one site.
///
/// Every field is optional so that layers (defaults, file, environment, CLI)
/// can be merged, later layers overriding the `Some` values of earlier ones.
/// Accessors resolve the remaining `None`s to built-in defaults.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub backend_url: Option<String>,
    pub tenant_id: Option<String>,
    pub storyfragment_id: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub session_ttl_hours: Option<u64>,
    pub store_path: Option<PathBuf>,
    pub visibility_threshold: Option<f64>,
    pub glossed_threshold_ms: Option<u64>,
    pub read_threshold_ms: Option<u64>,
}

impl ClientConfig {
    /// Built-in defaults. Identity fields stay unset.
    pub fn defaults() -> Self {
        Self {
            request_timeout_ms: Some(DEFAULT_REQUEST_TIMEOUT_MS),
            max_retries: Some(DEFAULT_MAX_RETRIES),
            session_ttl_hours: Some(DEFAULT_SESSION_TTL_HOURS),
            visibility_threshold: Some(DEFAULT_VISIBILITY_THRESHOLD),
            glossed_threshold_ms: Some(crate::engagement::GLOSSED_THRESHOLD_MS),
            read_threshold_ms: Some(crate::engagement::READ_THRESHOLD_MS),
            ..Default::default()
        }
    }

    // Merge two configs, where 'other' overrides 'self' for Some values
    pub fn merge(self, other: ClientConfig) -> ClientConfig {
        ClientConfig {
            backend_url: other.backend_url.or(self.backend_url),
            tenant_id: other.tenant_id.or(self.tenant_id),
            storyfragment_id: other.storyfragment_id.or(self.storyfragment_id),
            request_timeout_ms: other.request_timeout_ms.or(self.request_timeout_ms),
            max_retries: other.max_retries.or(self.max_retries),
            session_ttl_hours: other.session_ttl_hours.or(self.session_ttl_hours),
            store_path: other.store_path.or(self.store_path),
            visibility_threshold: other.visibility_threshold.or(self.visibility_threshold),
            glossed_threshold_ms: other.glossed_threshold_ms.or(self.glossed_threshold_ms),
            read_threshold_ms: other.read_threshold_ms.or(self.read_threshold_ms),
        }
    }

    /// Reads a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::ParseError {
            path: path.display().to_string(),
            source,
        })
    }

    /// Collects `TRACTSTACK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            backend_url: env::var("TRACTSTACK_BACKEND_URL").ok(),
            tenant_id: env::var("TRACTSTACK_TENANT_ID").ok(),
            storyfragment_id: env::var("TRACTSTACK_STORYFRAGMENT_ID").ok(),
            request_timeout_ms: parse_env("TRACTSTACK_REQUEST_TIMEOUT_MS")?,
            max_retries: parse_env("TRACTSTACK_MAX_RETRIES")?,
            session_ttl_hours: parse_env("TRACTSTACK_SESSION_TTL_HOURS")?,
            store_path: env::var("TRACTSTACK_STORE_PATH").ok().map(PathBuf::from),
            visibility_threshold: parse_env("TRACTSTACK_VISIBILITY_THRESHOLD")?,
            glossed_threshold_ms: None,
            read_threshold_ms: None,
        })
    }

    /// Defaults, then the optional file, then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::defaults();
        if let Some(path) = file {
            if path.exists() {
                config = config.merge(Self::from_file(path)?);
            } else {
                log::info!(
                    "Config file not found at {}. Using defaults and environment variables.",
                    path.display()
                );
            }
        }
        Ok(config.merge(Self::from_env()?))
    }

    /// Checks that the settings required to talk to a backend are present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let backend = self
            .backend_url
            .as_deref()
            .ok_or(ConfigError::MissingSetting("backendUrl"))?;
        match Url::parse(backend) {
            Ok(url) if url.has_host() => {}
            _ => return Err(ConfigError::InvalidBackendUrl(backend.to_string())),
        }
        match self.tenant_id.as_deref() {
            Some(t) if !t.trim().is_empty() => Ok(()),
            _ => Err(ConfigError::MissingSetting("tenantId")),
        }
    }

    pub fn backend_url(&self) -> &str {
        self.backend_url.as_deref().unwrap_or_default().trim_end_matches('/')
    }

    pub fn tenant_id(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or_default()
    }

    pub fn storyfragment_id(&self) -> &str {
        self.storyfragment_id.as_deref().unwrap_or_default()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_hours.unwrap_or(DEFAULT_SESSION_TTL_HOURS) * 3600)
    }

    pub fn visibility_threshold(&self) -> f64 {
        self.visibility_threshold.unwrap_or(DEFAULT_VISIBILITY_THRESHOLD)
    }

    pub fn glossed_threshold_ms(&self) -> u64 {
        self.glossed_threshold_ms
            .unwrap_or(crate::engagement::GLOSSED_THRESHOLD_MS)
    }

    pub fn read_threshold_ms(&self) -> u64 {
        self.read_threshold_ms.unwrap_or(crate::engagement::READ_THRESHOLD_MS)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base() -> ClientConfig {
        ClientConfig {
            backend_url: Some("http://127.0.0.1:8080/".to_string()),
            tenant_id: Some("default".to_string()),
            ..ClientConfig::defaults()
        }
    }

    #[test]
    fn test_merge_prefers_later_layer() {
        let file = ClientConfig {
            tenant_id: Some("acme".to_string()),
            request_timeout_ms: Some(2500),
            ..Default::default()
        };
        let merged = base().merge(file);
        assert_eq!(merged.tenant_id(), "acme");
        assert_eq!(merged.request_timeout(), Duration::from_millis(2500));
        // untouched fields survive
        assert_eq!(merged.max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(merged.backend_url(), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_validate() {
        assert!(base().validate().is_ok());

        let relative = ClientConfig {
            backend_url: Some("/api".to_string()),
            ..base()
        };
        assert!(matches!(
            relative.validate(),
            Err(ConfigError::InvalidBackendUrl(_))
        ));

        let no_tenant = ClientConfig {
            tenant_id: Some("  ".to_string()),
            ..base()
        };
        assert!(matches!(
            no_tenant.validate(),
            Err(ConfigError::MissingSetting("tenantId"))
        ));
    }

    #[test]
    fn test_from_file_camel_case() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"backendUrl":"https://story.example","tenantId":"t1","sessionTtlHours":2}}"#
        )
        .unwrap();
        let cfg = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.backend_url(), "https://story.example");
        assert_eq!(cfg.tenant_id(), "t1");
        assert_eq!(cfg.session_ttl(), Duration::from_secs(7200));
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            ClientConfig::from_file(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
