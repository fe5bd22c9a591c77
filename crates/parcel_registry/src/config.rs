use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use thiserror::Error;
use url::Url;

/// The registry that is used when none is configured.
pub const DEFAULT_REGISTRY_URL: &str = "https://pkg.parcel-data.dev";

/// Environment variable that overrides the configured registry url. An empty
/// value selects [`DEFAULT_REGISTRY_URL`].
pub const REGISTRY_URL_ENV: &str = "PARCEL_REGISTRY_URL";

/// Environment variable that overrides the configured bearer token.
pub const TOKEN_ENV: &str = "PARCEL_TOKEN";

/// A configuration value that cannot be used.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The registry url cannot be used.
    #[error("invalid registry url '{0}': {1}")]
    InvalidUrl(String, String),

    /// Invalid value for a field.
    #[error("invalid value for field {0}: {1}")]
    InvalidValue(String, String),
}

/// Errors that can occur when loading a configuration file.
#[derive(Error, Debug)]
pub enum LoadError {
    /// IO error while reading configuration file.
    #[error("IO error while reading configuration file: {0}")]
    IoError(#[from] std::io::Error),

    /// Error parsing configuration file.
    #[error("error parsing configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Error validating configuration.
    #[error("error validating configuration: {0}")]
    ValidationError(#[from] ValidationError),
}

fn default_registry_url() -> Url {
    Url::parse(DEFAULT_REGISTRY_URL).expect("the default registry url is valid")
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Number of objects that are uploaded in parallel during a push.
fn default_upload_concurrency() -> usize {
    20
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(500)
}

/// Everything needed to talk to a registry. Created once per invocation and
/// passed to the clients that need it.
#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// The base url of the registry.
    #[serde(default = "default_registry_url")]
    pub registry_url: Url,

    /// Bearer token sent with every registry API call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Upper bound for establishing a connection.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_timeout")]
    pub connect_timeout: Duration,

    /// Upper bound for a single read on an established connection.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_timeout")]
    pub read_timeout: Duration,

    /// The number of parallel upload workers used by push.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,

    /// How often a transient failure is retried.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// The delay before the first retry. Later retries back off exponentially.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_backoff_base", rename = "backoff-base-ms")]
    pub backoff_base: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_url: default_registry_url(),
            token: None,
            connect_timeout: default_timeout(),
            read_timeout: default_timeout(),
            upload_concurrency: default_upload_concurrency(),
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
        }
    }
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("registry_url", &self.registry_url.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("upload_concurrency", &self.upload_concurrency)
            .field("max_retries", &self.max_retries)
            .field("backoff_base", &self.backoff_base)
            .finish()
    }
}

impl RegistryConfig {
    /// Constructs a default configuration that talks to `registry_url`.
    pub fn with_registry_url(registry_url: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            registry_url: parse_registry_url(registry_url)?,
            ..Self::default()
        })
    }

    /// Returns `<config dir>/parcel/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("parcel").join("config.toml"))
    }

    /// Loads the configuration from a toml file.
    pub fn load_from_path(path: &Path) -> Result<Self, LoadError> {
        let content = fs_err::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        tracing::debug!("loaded registry configuration from {}", path.display());
        Ok(config)
    }

    /// Loads the configuration from [`Self::default_path`] if that file exists
    /// and applies the overrides from the environment.
    pub fn load() -> Result<Self, LoadError> {
        let config = match Self::default_path() {
            Some(path) if path.is_file() => Self::load_from_path(&path)?,
            _ => Self::default(),
        };
        Ok(config.with_env_overrides(|key| std::env::var(key).ok())?)
    }

    /// Applies the `PARCEL_REGISTRY_URL` and `PARCEL_TOKEN` overrides as
    /// returned by `lookup`.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ValidationError> {
        if let Some(url) = lookup(REGISTRY_URL_ENV) {
            self.registry_url = if url.trim().is_empty() {
                default_registry_url()
            } else {
                parse_registry_url(&url)?
            };
        }
        if let Some(token) = lookup(TOKEN_ENV).filter(|token| !token.is_empty()) {
            self.token = Some(token);
        }
        Ok(self)
    }

    /// Checks that every field holds a usable value.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_registry_url(&self.registry_url)?;
        if self.upload_concurrency == 0 {
            return Err(ValidationError::InvalidValue(
                "upload-concurrency".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses and validates a registry url.
pub fn parse_registry_url(url: &str) -> Result<Url, ValidationError> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| ValidationError::InvalidUrl(url.to_string(), e.to_string()))?;
    validate_registry_url(&parsed)?;
    Ok(parsed)
}

/// A registry url must be an http(s) url with a host and nothing after it.
fn validate_registry_url(url: &Url) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidUrl(url.to_string(), reason.to_string());
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("the scheme must be http or https"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("the url has no host"));
    }
    if url.path() != "/" {
        return Err(invalid("the url must not contain a path"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid("the url must not contain a query or fragment"));
    }
    Ok(())
}
