//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `config.yaml` but can be specified via the `-f` flag or the `IMGCLASS_CONFIG`
//! environment variable. A missing file is not an error: every field has a default.
//!
//! ## Loading Priority
//!
//! Sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `IMGCLASS_` override YAML values
//! 3. **CLASSIFIER_URL** - Special case: overrides `classifier.url` if set
//!
//! Nested values use double underscores, e.g. `IMGCLASS_CLASSIFIER__REQUEST_TIMEOUT=10s`.
//!
//! ## Example
//!
//! ```yaml
//! host: 0.0.0.0
//! port: 3000
//! classifier:
//!   url: http://classifier:5000
//!   request_timeout: 30s
//! staging:
//!   type: disk
//!   dir: /var/tmp/imgclass
//! limits:
//!   max_upload_bytes: 10485760
//! cors:
//!   allowed_origins: ["https://app.example.com"]
//! enable_metrics: true
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "IMGCLASS_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// External classification service
    pub classifier: ClassifierConfig,
    /// Where uploads are held while being classified
    pub staging: StagingConfig,
    /// Request size limits
    pub limits: LimitsConfig,
    /// CORS settings for browser clients
    pub cors: CorsConfig,
    /// Expose Prometheus metrics at `/internal/metrics`
    pub enable_metrics: bool,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            classifier: ClassifierConfig::default(),
            staging: StagingConfig::default(),
            limits: LimitsConfig::default(),
            cors: CorsConfig::default(),
            enable_metrics: false,
            enable_otel_export: false,
        }
    }
}

/// Connection settings for the external classification service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    /// Base URL of the service (e.g. `http://localhost:5000`)
    pub url: Url,
    /// Path of the classify endpoint, relative to `url`
    pub classify_path: String,
    /// Total time allowed for one classification call, including reading the body
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Time allowed to establish the TCP connection
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            url: Url::parse("http://localhost:5000").expect("default classifier URL is valid"),
            classify_path: "classify".to_string(),
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ClassifierConfig {
    /// Full URL of the classify endpoint
    pub fn classify_endpoint(&self) -> Result<Url, url::ParseError> {
        ensure_slash(&self.url).join(self.classify_path.trim_start_matches('/'))
    }
}

/// Makes sure a url has a trailing slash.
///
/// `Url::join` replaces the last path segment unless the base ends in '/', so
/// `http://host/v2` joined with `classify` would otherwise give `http://host/classify`.
fn ensure_slash(url: &Url) -> Url {
    if url.path().ends_with('/') {
        url.clone()
    } else {
        let mut new_url = url.clone();
        let mut path = new_url.path().to_string();
        path.push('/');
        new_url.set_path(&path);
        new_url
    }
}

/// Staging storage backend.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StagingConfig {
    /// Write uploads to files in `dir` (default: `<os temp dir>/imgclass-uploads`)
    Disk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dir: Option<PathBuf>,
    },
    /// Keep uploads in process memory
    Memory,
}

impl Default for StagingConfig {
    fn default() -> Self {
        StagingConfig::Disk { dir: None }
    }
}

impl StagingConfig {
    /// Directory used by disk staging, if that backend is selected
    pub fn disk_dir(&self) -> Option<PathBuf> {
        match self {
            StagingConfig::Disk { dir } => Some(dir.clone().unwrap_or_else(|| std::env::temp_dir().join("imgclass-uploads"))),
            StagingConfig::Memory => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Largest accepted request body for `/api/classify`, in bytes
    pub max_upload_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests
    pub allowed_origins: Vec<CorsOrigin>,
    /// Cache preflight requests for this many seconds
    pub max_age: Option<u64>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![CorsOrigin::Wildcard],
            max_age: Some(3600),
        }
    }
}

/// CORS origin specification.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard", serialize_with = "serialize_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://app.example.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn serialize_wildcard<S>(serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str("*")
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            // (IMGCLASS_CONFIG names the file itself and is not a config key)
            .merge(Env::prefixed("IMGCLASS_").ignore(&["config"]).split("__"))
            // Conventional variable for pointing at the classifier
            .merge(Env::raw().only(&["CLASSIFIER_URL"]).map(|_| "classifier.url".into()))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if !matches!(self.classifier.url.scheme(), "http" | "https") {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: classifier.url must use http or https, got '{}'",
                    self.classifier.url.scheme()
                ),
            });
        }

        if self.classifier.classify_path.trim_matches('/').is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: classifier.classify_path cannot be empty".to_string(),
            });
        }

        if let Err(e) = self.classifier.classify_endpoint() {
            return Err(Error::Internal {
                operation: format!("Config validation: invalid classifier endpoint: {e}"),
            });
        }

        if self.classifier.request_timeout.is_zero() || self.classifier.connect_timeout.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: classifier timeouts must be greater than zero".to_string(),
            });
        }

        if self.limits.max_upload_bytes == 0 {
            return Err(Error::Internal {
                operation: "Config validation: limits.max_upload_bytes must be greater than zero".to_string(),
            });
        }

        if self.cors.allowed_origins.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: CORS allowed_origins cannot be empty. Add at least one allowed origin.".to_string(),
            });
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
