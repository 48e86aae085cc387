//! # caql-convert - Graphite to CAQL Dashboard Converter
//!
//! Moves Grafana dashboards that query Graphite onto the Circonus CAQL
//! datasource. Every panel target goes through the IRONdb graphite
//! translator, and the StatsD aggregation suffixes that Graphite bakes into
//! metric names (`.upper_90`, `.count`, ...) are rewritten into explicit CAQL
//! histogram functions.
//!
//! ## Pipeline
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────────────────┐   ┌──────────────┐
//! │ GRAFANA SRC  │ → │ GRAPHITE → CAQL  │ → │ STATSD AGG REWRITER  │ → │ GRAFANA DEST │
//! │ folder scan  │   │ translator call  │   │ tag index + mapper   │   │ upload       │
//! └──────────────┘   └──────────────────┘   └──────────────────────┘   └──────────────┘
//! ```
//!
//! ## Rewriting
//!
//! A translated query contains `graphite:find('<pattern>')` calls. For each
//! one the tag index is asked which `statsd_type` the matching series carry,
//! and the call becomes `find:histogram('<name>') | <fragment>` when either
//! the name suffix or the resolved type is an enabled aggregation keyword.
//! Everything that cannot be resolved is left as it was.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

// lib and bin share this file; the bin target never sees the lib-only API
#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use futures::future::join_all;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn, Level};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Url};

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use once_cell::sync::Lazy;
use regex::Regex;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand, ValueEnum};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Converter version - follows semantic versioning
pub const CONVERTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CONVERTER_NAME: &str = "caql-convert";
pub const CONVERTER_FULL_NAME: &str = "Graphite to CAQL Dashboard Converter";

// ----------------------------------------------------------------------------
// Circonus / IRONdb
// ----------------------------------------------------------------------------

/// Default IRONdb host
pub const DEFAULT_CIRCONUS_HOST: &str = "localhost";

/// Default IRONdb HTTP port
pub const DEFAULT_CIRCONUS_PORT: u16 = 8112;

/// Default account id used by the tag search endpoint
pub const DEFAULT_ACCOUNT_ID: &str = "1";

/// Lua extension that turns Graphite queries into CAQL
pub const DEFAULT_TRANSLATE_PATH: &str = "/extension/lua/graphite_translate";

/// Tag search endpoint; `{account_id}` is substituted at client construction
pub const DEFAULT_TAGS_PATH: &str = "/find/{account_id}/tags";

/// Interval at which StatsD flushes aggregates (seconds)
pub const DEFAULT_STATSD_FLUSH_INTERVAL_SECS: u64 = 10;

/// Value sent in the `X-Circonus-App-Name` header
pub const DEFAULT_APP_NAME: &str = "caql-convert";

pub const HEADER_AUTH_TOKEN: &str = "x-circonus-auth-token";
pub const HEADER_APP_NAME: &str = "x-circonus-app-name";
pub const HEADER_ACCOUNT_ID: &str = "x-circonus-account-id";

// ----------------------------------------------------------------------------
// Grafana
// ----------------------------------------------------------------------------

pub const DEFAULT_GRAFANA_HOST: &str = "localhost";
pub const DEFAULT_GRAFANA_PORT: u16 = 3000;

// ----------------------------------------------------------------------------
// Timing & Concurrency
// ----------------------------------------------------------------------------

/// Default timeout for every outbound HTTP request (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default number of targets converted concurrently
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Upper bound for `circonus.concurrency`
pub const MAX_CONCURRENCY: usize = 256;

// ----------------------------------------------------------------------------
// Query Rewriting
// ----------------------------------------------------------------------------

/// Tag category that declares which StatsD statistic a stream carries
pub const STATSD_TYPE_CATEGORY: &str = "statsd_type";

/// Directive prefixed once to every rewritten query
pub const MIN_PERIOD_DIRECTIVE: &str = "#min_period=";

/// Opening marker of a stream tag block inside a metric name
pub const STREAM_TAG_OPEN: &str = "|ST[";

// ----------------------------------------------------------------------------
// Configuration Files
// ----------------------------------------------------------------------------

/// Prefix for environment overrides, `__` separates nesting levels
pub const ENV_PREFIX: &str = "CAQL_CONVERT_";

/// Config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "caql-convert.toml";

/// Config file looked up in the home directory
pub const HOME_CONFIG_FILE: &str = ".caql-convert.toml";

// ============================================================================
// SECTION 3: ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per subsystem, folded into `ConvertError` at the edges.
// Only translation failures surface per target; tag index failures are
// absorbed by the rewriter and never escape it.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Top-Level Errors
// ----------------------------------------------------------------------------

/// The main error type for the converter.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Translation error: {0}")]
    Translation(#[from] TranslationError),

    #[error("Tag lookup error: {0}")]
    TagLookup(#[from] TagLookupError),

    #[error("Metric name error: {0}")]
    StreamTag(#[from] StreamTagError),

    #[error("Grafana error: {0}")]
    Grafana(#[from] GrafanaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConvertError {
    /// Check if the run can continue past this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            ConvertError::Config(_) => false,
            ConvertError::Translation(_) => true,
            ConvertError::TagLookup(_) => true,
            ConvertError::StreamTag(_) => true,
            ConvertError::Grafana(e) => e.is_recoverable(),
            ConvertError::Io(_) => false,
            ConvertError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ConvertError::Config(_) => "config",
            ConvertError::Translation(_) => "translation",
            ConvertError::TagLookup(_) => "tag_lookup",
            ConvertError::StreamTag(_) => "stream_tag",
            ConvertError::Grafana(_) => "grafana",
            ConvertError::Io(_) => "io",
            ConvertError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 3.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Failed to render configuration as {format}: {message}")]
    RenderFailed { format: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Translation Errors
// ----------------------------------------------------------------------------

/// Failures of the graphite translator call. Terminal for the one query.
#[derive(Error, Debug)]
pub enum TranslationError {
    #[error("error fetching translation from '{endpoint}': {message}")]
    Transport { endpoint: String, message: String },

    #[error("translation request to '{endpoint}' timed out")]
    Timeout { endpoint: String },

    #[error("error unmarshaling translation response (status {status}): {message}")]
    InvalidResponse { status: u16, message: String },

    #[error("translator returned no CAQL for '{query}'")]
    EmptyResult { query: String },

    #[error("error translating graphite query '{query}': {message}")]
    Service { query: String, message: String },
}

// ----------------------------------------------------------------------------
// 3.4 Tag Lookup Errors
// ----------------------------------------------------------------------------

/// Failures of the tag index lookup. Never fatal to a rewrite.
#[derive(Error, Debug)]
pub enum TagLookupError {
    #[error("tag search against '{endpoint}' failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("tag search for '{pattern}' returned status {status}")]
    Status { status: u16, pattern: String },

    #[error("invalid tag search response: {message}")]
    InvalidResponse { message: String },
}

impl TagLookupError {
    /// Numeric HTTP status, when the index answered at all
    pub fn status_code(&self) -> Option<u16> {
        match self {
            TagLookupError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 4xx answers are soft: the caller falls back to name heuristics quietly
    pub fn is_client_error(&self) -> bool {
        matches!(self.status_code(), Some(status) if (400..500).contains(&status))
    }
}

// ----------------------------------------------------------------------------
// 3.5 Stream Tag Errors
// ----------------------------------------------------------------------------

/// A metric name from the tag index that cannot be decomposed into tags.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamTagError {
    #[error("unterminated stream tag block in '{name}'")]
    Unterminated { name: String },

    #[error("stream tag with empty category in '{name}'")]
    EmptyCategory { name: String },

    #[error("invalid base64 tag token '{token}': {message}")]
    InvalidBase64 { token: String, message: String },

    #[error("tag token '{token}' is not valid UTF-8")]
    InvalidUtf8 { token: String },
}

// ----------------------------------------------------------------------------
// 3.6 Grafana Errors
// ----------------------------------------------------------------------------

/// Errors from the Grafana HTTP API
#[derive(Error, Debug)]
pub enum GrafanaError {
    #[error("request to '{endpoint}' failed: {message}")]
    Request { endpoint: String, message: String },

    #[error("'{endpoint}' returned status {status}: {body}")]
    Status { endpoint: String, status: u16, body: String },

    #[error("invalid response from '{endpoint}': {message}")]
    InvalidResponse { endpoint: String, message: String },

    #[error("folder '{name}' not found")]
    FolderNotFound { name: String },

    #[error("found {count} folders titled '{name}', please check folder name")]
    AmbiguousFolder { name: String, count: usize },
}

impl GrafanaError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            GrafanaError::Request { .. } => true,
            GrafanaError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

// ----------------------------------------------------------------------------
// 3.7 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for converter operations
pub type ConvertResult<T> = Result<T, ConvertError>;

/// Result type for Grafana API operations
pub type GrafanaResult<T> = Result<T, GrafanaError>;

// ============================================================================
// SECTION 4: CONFIGURATION SYSTEM
// ============================================================================
// Layered with figment: built-in defaults, then the TOML file, then
// `CAQL_CONVERT_*` environment variables (`__` splits nested keys).
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the converter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Log request and response bodies of every API call
    #[serde(default)]
    pub debug: bool,

    /// Circonus / IRONdb settings
    #[serde(default)]
    pub circonus: CirconusConfig,

    /// Grafana settings
    #[serde(default)]
    pub grafana: GrafanaConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            debug: false,
            circonus: CirconusConfig::default(),
            grafana: GrafanaConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ConverterConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract(Self::base_figment().merge(Toml::file(path)))
    }

    /// Load from an optional file; defaults plus environment when absent
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Self::extract(Self::base_figment()),
        }
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    fn base_figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })
    }

    /// Validate everything a dashboard conversion run needs
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circonus.validate()?;
        self.grafana.validate()?;
        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ConfigError::RenderFailed {
            format: "toml".into(),
            message: e.to_string(),
        })
    }

    /// Copy with API tokens masked, for display
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.circonus.api_token = redact(&config.circonus.api_token);
        config.grafana.api_token = redact(&config.grafana.api_token);
        config
    }

    /// Render the configuration in the requested format
    pub fn render(&self, format: ConfigFormat) -> Result<String, ConfigError> {
        let rendered = match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(|e| e.to_string()),
            ConfigFormat::Toml => toml::to_string_pretty(self).map_err(|e| e.to_string()),
            ConfigFormat::Yaml => serde_yaml::to_string(self).map_err(|e| e.to_string()),
        };
        rendered.map_err(|message| ConfigError::RenderFailed {
            format: format.to_string(),
            message,
        })
    }
}

fn redact(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        "********".into()
    }
}

/// Output formats for `show-config`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConfigFormat {
    Json,
    Toml,
    Yaml,
}

impl Display for ConfigFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigFormat::Json => write!(f, "json"),
            ConfigFormat::Toml => write!(f, "toml"),
            ConfigFormat::Yaml => write!(f, "yaml"),
        }
    }
}

/// Digit-only environment values arrive as numbers; keep them as text
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Unsigned(u64),
        Signed(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(text) => text,
        Scalar::Unsigned(n) => n.to_string(),
        Scalar::Signed(n) => n.to_string(),
        Scalar::Float(n) => n.to_string(),
        Scalar::Bool(b) => b.to_string(),
    })
}

fn default_true() -> bool {
    true
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// 4.2 Circonus Configuration
// ----------------------------------------------------------------------------

/// Circonus / IRONdb settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CirconusConfig {
    /// Talk to IRONdb directly (no API token headers)
    #[serde(default = "default_true")]
    pub direct_irondb: bool,

    /// API token, sent as `X-Circonus-Auth-Token` when not direct
    #[serde(default, deserialize_with = "string_or_number")]
    pub api_token: String,

    /// Application name sent as `X-Circonus-App-Name`
    #[serde(default = "default_app_name", deserialize_with = "string_or_number")]
    pub app_name: String,

    /// Account id used by the tag search
    #[serde(default = "default_account_id", deserialize_with = "string_or_number")]
    pub account_id: String,

    #[serde(default = "default_circonus_host")]
    pub host: String,

    #[serde(default = "default_circonus_port")]
    pub port: u16,

    /// Use https
    #[serde(default)]
    pub secure: bool,

    #[serde(default = "default_translate_path")]
    pub translate_path: String,

    #[serde(default = "default_tags_path")]
    pub tags_path: String,

    /// StatsD flush interval in seconds, emitted as `#min_period`
    #[serde(default = "default_statsd_interval")]
    pub statsd_interval: u64,

    #[serde(default)]
    pub statsd_aggregations: StatsdAggregationsConfig,

    /// Timeout applied to every translator and tag index request
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Targets converted concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for CirconusConfig {
    fn default() -> Self {
        Self {
            direct_irondb: true,
            api_token: String::new(),
            app_name: default_app_name(),
            account_id: default_account_id(),
            host: default_circonus_host(),
            port: default_circonus_port(),
            secure: false,
            translate_path: default_translate_path(),
            tags_path: default_tags_path(),
            statsd_interval: default_statsd_interval(),
            statsd_aggregations: StatsdAggregationsConfig::default(),
            timeout: default_http_timeout(),
            concurrency: default_concurrency(),
        }
    }
}

impl CirconusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::missing_field("circonus.host"));
        }
        if !self.direct_irondb && self.api_token.is_empty() {
            return Err(ConfigError::invalid_value(
                "circonus.api_token",
                "an API token is required unless direct_irondb is set",
            ));
        }
        if self.statsd_interval == 0 {
            return Err(ConfigError::invalid_value(
                "circonus.statsd_interval",
                "flush interval must be at least 1 second",
            ));
        }
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::invalid_value(
                "circonus.concurrency",
                format!("must be between 1 and {}", MAX_CONCURRENCY),
            ));
        }
        if self.statsd_aggregations.remove {
            let unknown: Vec<&str> = self
                .statsd_aggregations
                .agg_list
                .iter()
                .map(String::as_str)
                .filter(|keyword| map_aggregation(keyword, 0).is_none())
                .collect();
            if !unknown.is_empty() {
                return Err(ConfigError::invalid_value(
                    "circonus.statsd_aggregations.agg_list",
                    format!("unsupported aggregations: {}", unknown.join(", ")),
                ));
            }
        }
        Ok(())
    }

    /// Read-only rewriting settings. Nothing is enabled unless `remove` is set.
    pub fn aggregation_config(&self) -> AggregationConfig {
        let aggs = &self.statsd_aggregations;
        let enabled = if aggs.remove {
            aggs.agg_list.iter().cloned().collect()
        } else {
            BTreeSet::new()
        };
        AggregationConfig::new(enabled, aggs.period, self.statsd_interval)
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let scheme = if self.secure { "https" } else { "http" };
        Url::parse(&format!("{}://{}:{}/", scheme, self.host, self.port))
            .map_err(|e| ConfigError::invalid_value("circonus.host", e.to_string()))
    }

    pub fn translate_url(&self) -> Result<Url, ConfigError> {
        self.base_url()?
            .join(&self.translate_path)
            .map_err(|e| ConfigError::invalid_value("circonus.translate_path", e.to_string()))
    }

    pub fn tags_url(&self) -> Result<Url, ConfigError> {
        let path = self.tags_path.replace("{account_id}", &self.account_id);
        self.base_url()?
            .join(&path)
            .map_err(|e| ConfigError::invalid_value("circonus.tags_path", e.to_string()))
    }

    /// Auth headers for API mode; direct IRONdb access sends none
    pub fn request_headers(&self, include_account: bool) -> Result<HeaderMap, ConfigError> {
        let mut headers = HeaderMap::new();
        if self.direct_irondb {
            return Ok(headers);
        }
        headers.insert(
            HeaderName::from_static(HEADER_AUTH_TOKEN),
            header_value("circonus.api_token", &self.api_token)?,
        );
        headers.insert(
            HeaderName::from_static(HEADER_APP_NAME),
            header_value("circonus.app_name", &self.app_name)?,
        );
        if include_account && !self.account_id.is_empty() {
            headers.insert(
                HeaderName::from_static(HEADER_ACCOUNT_ID),
                header_value("circonus.account_id", &self.account_id)?,
            );
        }
        Ok(headers)
    }

    pub fn http_client(&self) -> ConvertResult<HttpClient> {
        build_http_client(self.timeout, self.concurrency)
    }
}

/// StatsD suffix rewriting options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsdAggregationsConfig {
    /// Rewrite aggregation suffixes at all
    #[serde(default)]
    pub remove: bool,

    /// Aggregation keywords to recognize, e.g. `["upper_90", "count"]`
    #[serde(default)]
    pub agg_list: Vec<String>,

    /// Period in seconds for `sum` fragments, 0 = none
    #[serde(default)]
    pub period: u64,
}

fn default_app_name() -> String {
    DEFAULT_APP_NAME.into()
}

fn default_account_id() -> String {
    DEFAULT_ACCOUNT_ID.into()
}

fn default_circonus_host() -> String {
    DEFAULT_CIRCONUS_HOST.into()
}

fn default_circonus_port() -> u16 {
    DEFAULT_CIRCONUS_PORT
}

fn default_translate_path() -> String {
    DEFAULT_TRANSLATE_PATH.into()
}

fn default_tags_path() -> String {
    DEFAULT_TAGS_PATH.into()
}

fn default_statsd_interval() -> u64 {
    DEFAULT_STATSD_FLUSH_INTERVAL_SECS
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn header_value(field: &str, value: &str) -> Result<HeaderValue, ConfigError> {
    HeaderValue::from_str(value).map_err(|e| ConfigError::invalid_value(field, e.to_string()))
}

fn build_http_client(timeout: Duration, pool_size: usize) -> ConvertResult<HttpClient> {
    HttpClient::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(pool_size)
        .user_agent(format!("{}/{}", CONVERTER_NAME, CONVERTER_VERSION))
        .build()
        .map_err(|e| ConvertError::Internal(format!("Failed to build HTTP client: {}", e)))
}

// ----------------------------------------------------------------------------
// 4.3 Grafana Configuration
// ----------------------------------------------------------------------------

/// Grafana settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrafanaConfig {
    #[serde(default = "default_grafana_host")]
    pub host: String,

    #[serde(default = "default_grafana_port")]
    pub port: u16,

    /// Sub-path when Grafana is served behind a prefix
    #[serde(default, deserialize_with = "string_or_number")]
    pub path: String,

    #[serde(default, deserialize_with = "string_or_number")]
    pub api_token: String,

    #[serde(default)]
    pub anonymous_auth: bool,

    /// Use https
    #[serde(default)]
    pub secure: bool,

    /// Folder holding the Graphite dashboards
    #[serde(default, deserialize_with = "string_or_number")]
    pub src_folder: String,

    /// Folder receiving the converted dashboards (created when missing)
    #[serde(default, deserialize_with = "string_or_number")]
    pub dest_folder: String,

    /// Datasources whose panels get converted; empty = every panel
    #[serde(default)]
    pub graphite_datasources: Vec<String>,

    /// Datasource assigned to converted panels
    #[serde(default, deserialize_with = "string_or_number")]
    pub circonus_datasource: String,

    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for GrafanaConfig {
    fn default() -> Self {
        Self {
            host: default_grafana_host(),
            port: default_grafana_port(),
            path: String::new(),
            api_token: String::new(),
            anonymous_auth: false,
            secure: false,
            src_folder: String::new(),
            dest_folder: String::new(),
            graphite_datasources: Vec::new(),
            circonus_datasource: String::new(),
            timeout: default_http_timeout(),
        }
    }
}

impl GrafanaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_token.is_empty() && !self.anonymous_auth {
            return Err(ConfigError::invalid_value(
                "grafana.api_token",
                "Grafana API Token must be set",
            ));
        }
        if self.host.is_empty() {
            return Err(ConfigError::missing_field("grafana.host"));
        }
        if self.src_folder.is_empty() || self.dest_folder.is_empty() {
            return Err(ConfigError::invalid_value(
                "grafana.src_folder",
                "must provide source and destination Grafana folders",
            ));
        }
        Ok(())
    }

    /// Base URL, always ending in `/` so relative API paths join under it
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let scheme = if self.secure { "https" } else { "http" };
        let path = self.path.trim_matches('/');
        let raw = if path.is_empty() {
            format!("{}://{}:{}/", scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}/{}/", scheme, self.host, self.port, path)
        };
        Url::parse(&raw).map_err(|e| ConfigError::invalid_value("grafana.host", e.to_string()))
    }

    pub fn request_headers(&self) -> Result<HeaderMap, ConfigError> {
        let mut headers = HeaderMap::new();
        if !self.anonymous_auth && !self.api_token.is_empty() {
            headers.insert(
                AUTHORIZATION,
                header_value("grafana.api_token", &format!("Bearer {}", self.api_token))?,
            );
        }
        Ok(headers)
    }
}

fn default_grafana_host() -> String {
    DEFAULT_GRAFANA_HOST.into()
}

fn default_grafana_port() -> u16 {
    DEFAULT_GRAFANA_PORT
}

// ----------------------------------------------------------------------------
// 4.4 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Also log to this file
    #[serde(default)]
    pub file: Option<String>,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

/// Config file to use when `--config` is not given: the working directory
/// first, then the home directory.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    dirs::home_dir()
        .map(|home| home.join(HOME_CONFIG_FILE))
        .filter(|path| path.exists())
}

// ============================================================================
// SECTION 5: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Log Level Management
// ----------------------------------------------------------------------------

/// Log levels for the converter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Parse from string, unknown levels fall back to info
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.2 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration.
///
/// Every event is formatted into a single buffer before it is written, so
/// lines from concurrent conversion tasks never interleave. The returned
/// guard flushes the file sink and must live until exit.
pub fn init_logging(config: &LoggingConfig) -> ConvertResult<Option<WorkerGuard>> {
    let level_filter = LevelFilter::from_level(LogLevel::parse(&config.level).to_tracing_level());

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let (file_layer, guard) = match config.file.as_deref().filter(|f| !f.is_empty()) {
        Some(file) => {
            let path = Path::new(file);
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().ok_or_else(|| {
                ConfigError::invalid_value("logging.file", "must name a file")
            })?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);

    let installed = match config.format.as_str() {
        "json" => registry
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        "compact" => registry
            .with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        _ => registry
            .with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    installed.map_err(|e| ConvertError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "caql_convert::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(guard)
}

/// Pretty-print a serializable value at debug level
fn log_json<T: Serialize + ?Sized>(target_msg: &str, value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(pretty) => debug!(target: "caql_convert::debug", "{}:\n{}", target_msg, pretty),
        Err(e) => debug!(target: "caql_convert::debug", error = %e, "{}: <unprintable>", target_msg),
    }
}

// ============================================================================
// SECTION 6: AGGREGATION → CAQL MAPPER
// ============================================================================
// StatsD aggregation keywords mapped onto CAQL histogram fragments. Two
// tiers: exact keywords first, then `<prefix>_<N>` composites. New keywords
// are new table rows.
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Fragment Tables
// ----------------------------------------------------------------------------

/// Fragment produced by an exact keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExactFragment {
    Fixed(&'static str),
    /// `sum()`, with a period clause when one is configured
    Sum,
}

/// Fragment produced by a `<prefix>_<N>` keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParametricFragment {
    ClampMean,
    ClampSum,
    Percentile,
}

static EXACT_AGGREGATIONS: &[(&str, ExactFragment)] = &[
    ("sum", ExactFragment::Sum),
    ("count", ExactFragment::Fixed("count()")),
    ("mean", ExactFragment::Fixed("mean()")),
    ("lower", ExactFragment::Fixed("min()")),
    ("median", ExactFragment::Fixed("percentile(50)")),
    ("upper", ExactFragment::Fixed("max()")),
    ("upper_90", ExactFragment::Fixed("percentile(90)")),
    ("upper_95", ExactFragment::Fixed("percentile(95)")),
    ("upper_99", ExactFragment::Fixed("percentile(99)")),
    ("count_ps", ExactFragment::Fixed("rate(period=1s)")),
    ("std", ExactFragment::Fixed("stddev()")),
];

static PARAMETRIC_AGGREGATIONS: &[(&str, ParametricFragment)] = &[
    ("mean", ParametricFragment::ClampMean),
    ("sum", ParametricFragment::ClampSum),
    ("upper", ParametricFragment::Percentile),
];

// ----------------------------------------------------------------------------
// 6.2 Lookup
// ----------------------------------------------------------------------------

fn sum_fragment(period_secs: u64) -> String {
    if period_secs > 0 {
        format!("sum(period={}s)", period_secs)
    } else {
        "sum()".into()
    }
}

/// Map a StatsD aggregation keyword onto its CAQL fragment.
///
/// Returns `None` for anything the tables do not know, which callers treat
/// as "not an aggregation".
///
/// ```
/// use caql_convert::map_aggregation;
///
/// assert_eq!(map_aggregation("upper_95", 0).as_deref(), Some("percentile(95)"));
/// assert_eq!(map_aggregation("sum", 30).as_deref(), Some("sum(period=30s)"));
/// assert_eq!(map_aggregation("not_a_keyword", 0), None);
/// ```
pub fn map_aggregation(keyword: &str, period_secs: u64) -> Option<String> {
    if let Some((_, fragment)) = EXACT_AGGREGATIONS.iter().find(|(k, _)| *k == keyword) {
        return Some(match fragment {
            ExactFragment::Fixed(text) => (*text).to_string(),
            ExactFragment::Sum => sum_fragment(period_secs),
        });
    }

    let (prefix, value) = keyword.split_once('_')?;
    let (_, fragment) = PARAMETRIC_AGGREGATIONS.iter().find(|(p, _)| *p == prefix)?;
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let bound: u64 = value.parse().ok()?;

    match fragment {
        ParametricFragment::ClampMean => Some(format!("clamp(0,{}) | mean()", bound)),
        ParametricFragment::ClampSum => {
            Some(format!("clamp(0,{}) | {}", bound, sum_fragment(period_secs)))
        }
        ParametricFragment::Percentile if bound <= 100 => Some(format!("percentile({})", bound)),
        ParametricFragment::Percentile => None,
    }
}

// ============================================================================
// SECTION 7: STREAM TAG PARSER
// ============================================================================
// Circonus metric names carry their tags inline:
//
//   app.requests|ST[statsd_type:upper_90,b"ZW52":b"cHJvZA=="]
//
// Either side of a tag may be base64 wrapped in `b"..."`.
// ============================================================================

/// A single `category:value` stream tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamTag {
    pub category: String,
    pub value: String,
}

impl StreamTag {
    pub fn new(category: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            value: value.into(),
        }
    }
}

/// Decomposes a tagged metric name into its stream tags
pub trait MetricNameParser: Send + Sync {
    fn parse_tags(&self, metric_name: &str) -> Result<Vec<StreamTag>, StreamTagError>;
}

/// Parser for the `|ST[...]` stream tag syntax
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTagParser;

impl StreamTagParser {
    fn decode_token(&self, token: &str) -> Result<String, StreamTagError> {
        let encoded = match token
            .strip_prefix("b\"")
            .and_then(|rest| rest.strip_suffix('"'))
        {
            Some(encoded) => encoded,
            None => return Ok(token.to_string()),
        };

        let bytes = BASE64_STANDARD
            .decode(encoded)
            .map_err(|e| StreamTagError::InvalidBase64 {
                token: token.to_string(),
                message: e.to_string(),
            })?;

        String::from_utf8(bytes).map_err(|_| StreamTagError::InvalidUtf8 {
            token: token.to_string(),
        })
    }

    fn parse_block(&self, name: &str, block: &str, tags: &mut Vec<StreamTag>) -> Result<(), StreamTagError> {
        for raw in block.split(',').filter(|t| !t.is_empty()) {
            let (category, value) = raw.split_once(':').unwrap_or((raw, ""));
            let category = self.decode_token(category)?;
            if category.is_empty() {
                return Err(StreamTagError::EmptyCategory {
                    name: name.to_string(),
                });
            }
            let value = self.decode_token(value)?;
            tags.push(StreamTag { category, value });
        }
        Ok(())
    }
}

impl MetricNameParser for StreamTagParser {
    fn parse_tags(&self, metric_name: &str) -> Result<Vec<StreamTag>, StreamTagError> {
        let mut tags = Vec::new();
        let mut rest = metric_name;

        while let Some(open) = rest.find(STREAM_TAG_OPEN) {
            let block_start = open + STREAM_TAG_OPEN.len();
            let close = rest[block_start..]
                .find(']')
                .ok_or_else(|| StreamTagError::Unterminated {
                    name: metric_name.to_string(),
                })?;
            self.parse_block(metric_name, &rest[block_start..block_start + close], &mut tags)?;
            rest = &rest[block_start + close + 1..];
        }

        Ok(tags)
    }
}

// ============================================================================
// SECTION 8: TAG RESOLVER
// ============================================================================
// Answers "which statsd_type do the series behind this pattern carry?"
// Lookups never fail the caller: every problem degrades to `Unknown`.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Types
// ----------------------------------------------------------------------------

/// One entry of a tag search response. Extra fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub metric_name: String,
}

impl MetricDescriptor {
    pub fn new(metric_name: impl Into<String>) -> Self {
        Self {
            metric_name: metric_name.into(),
        }
    }
}

/// The `statsd_type` carried by the series behind one pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolvedType {
    /// No series, or none carried a `statsd_type` tag
    Unknown,
    /// Every tagged series agrees on this type
    Single(String),
    /// At least two series disagree
    Conflicting,
}

impl ResolvedType {
    pub fn as_single(&self) -> Option<&str> {
        match self {
            ResolvedType::Single(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_single(&self, expected: &str) -> bool {
        self.as_single() == Some(expected)
    }
}

impl Display for ResolvedType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedType::Unknown => write!(f, "unknown"),
            ResolvedType::Single(value) => write!(f, "{}", value),
            ResolvedType::Conflicting => write!(f, "conflicting"),
        }
    }
}

/// Template placeholders such as `$host` or `${env}`, up to the next dot
static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$[^.]+").expect("placeholder pattern is valid"));

/// Replace every dashboard template variable with a `*` wildcard
pub fn normalize_pattern(pattern: &str) -> Cow<'_, str> {
    PLACEHOLDER_RE.replace_all(pattern, "*")
}

// ----------------------------------------------------------------------------
// 8.2 Tag Index Trait
// ----------------------------------------------------------------------------

/// Metadata index that can be searched by graphite name pattern
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TagIndex: Send + Sync {
    async fn find_matching_metrics(&self, pattern: &str) -> Result<Vec<MetricDescriptor>, TagLookupError>;
}

// ----------------------------------------------------------------------------
// 8.3 Circonus Tag Index
// ----------------------------------------------------------------------------

/// Tag search against IRONdb or the Circonus API
pub struct CirconusTagIndex {
    client: HttpClient,
    url: Url,
    headers: HeaderMap,
    debug: bool,
}

impl CirconusTagIndex {
    pub fn new(client: HttpClient, url: Url, headers: HeaderMap, debug: bool) -> Self {
        Self {
            client,
            url,
            headers,
            debug,
        }
    }

    pub fn from_config(client: HttpClient, config: &CirconusConfig, debug: bool) -> ConvertResult<Self> {
        Ok(Self::new(
            client,
            config.tags_url()?,
            config.request_headers(true)?,
            debug,
        ))
    }

    pub fn search_query(pattern: &str) -> String {
        format!("and(__name:[graphite]{})", pattern)
    }
}

impl Debug for CirconusTagIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CirconusTagIndex")
            .field("url", &self.url.as_str())
            .field("debug", &self.debug)
            .finish()
    }
}

#[async_trait]
impl TagIndex for CirconusTagIndex {
    async fn find_matching_metrics(&self, pattern: &str) -> Result<Vec<MetricDescriptor>, TagLookupError> {
        let query = Self::search_query(pattern);
        if self.debug {
            debug!(target: "caql_convert::tags", url = %self.url, query = %query, "Tag search request");
        }

        let response = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .query(&[("query", query.as_str())])
            .send()
            .await
            .map_err(|e| TagLookupError::Transport {
                endpoint: self.url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let err = TagLookupError::Status {
                status: status.as_u16(),
                pattern: pattern.to_string(),
            };
            if err.is_client_error() {
                warn!(
                    target: "caql_convert::tags",
                    pattern = %pattern,
                    status = status.as_u16(),
                    "Tag search rejected, falling back to name heuristics"
                );
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let descriptors: Vec<MetricDescriptor> =
            response
                .json()
                .await
                .map_err(|e| TagLookupError::InvalidResponse {
                    message: e.to_string(),
                })?;

        if self.debug {
            log_json("Tag search response", &descriptors);
        }
        Ok(descriptors)
    }
}

// ----------------------------------------------------------------------------
// 8.4 Resolver
// ----------------------------------------------------------------------------

/// Resolves the statsd_type of the series behind a metric pattern
#[derive(Clone)]
pub struct TagResolver {
    index: Arc<dyn TagIndex>,
    parser: Arc<dyn MetricNameParser>,
}

impl Debug for TagResolver {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagResolver").finish_non_exhaustive()
    }
}

impl TagResolver {
    pub fn new(index: Arc<dyn TagIndex>, parser: Arc<dyn MetricNameParser>) -> Self {
        Self { index, parser }
    }

    /// Resolver using the stream tag syntax
    pub fn with_index(index: Arc<dyn TagIndex>) -> Self {
        Self::new(index, Arc::new(StreamTagParser))
    }

    /// Search the index after replacing template placeholders with wildcards
    pub async fn find_matching_metrics(&self, pattern: &str) -> Result<Vec<MetricDescriptor>, TagLookupError> {
        let search = normalize_pattern(pattern);
        let descriptors = self.index.find_matching_metrics(&search).await?;
        if descriptors.is_empty() {
            warn!(target: "caql_convert::tags", pattern = %search, "No metrics found, statsd type unknown");
        }
        Ok(descriptors)
    }

    /// Resolve the type for a pattern. Lookup failures resolve as `Unknown`.
    pub async fn resolve_type(&self, pattern: &str) -> ResolvedType {
        match self.find_matching_metrics(pattern).await {
            Ok(descriptors) => self.resolve_from_descriptors(pattern, &descriptors),
            Err(e) => {
                error!(
                    target: "caql_convert::tags",
                    pattern = %pattern,
                    status = ?e.status_code(),
                    error = %e,
                    "Tag search failed, resolving type from name only"
                );
                ResolvedType::Unknown
            }
        }
    }

    /// Collapse the `statsd_type` tags of all descriptors into one type.
    /// Stops at the second distinct value.
    pub fn resolve_from_descriptors(&self, pattern: &str, descriptors: &[MetricDescriptor]) -> ResolvedType {
        let mut resolved: Option<String> = None;

        for descriptor in descriptors {
            let tags = match self.parser.parse_tags(&descriptor.metric_name) {
                Ok(tags) => tags,
                Err(e) => {
                    warn!(
                        target: "caql_convert::tags",
                        metric = %descriptor.metric_name,
                        error = %e,
                        "Skipping unparseable metric name"
                    );
                    continue;
                }
            };

            for tag in tags.into_iter().filter(|t| t.category == STATSD_TYPE_CATEGORY) {
                match &resolved {
                    None => resolved = Some(tag.value),
                    Some(existing) if *existing == tag.value => {}
                    Some(existing) => {
                        warn!(
                            target: "caql_convert::tags",
                            pattern = %pattern,
                            first = %existing,
                            second = %tag.value,
                            "Series disagree on statsd type"
                        );
                        return ResolvedType::Conflicting;
                    }
                }
            }
        }

        match resolved {
            Some(value) => ResolvedType::Single(value),
            None => ResolvedType::Unknown,
        }
    }
}

// ============================================================================
// SECTION 9: TRANSLATION GATEWAY
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Wire Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
}

/// Translator answer; a non-empty `error` or an empty `caql` is a failure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationResult {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub caql: String,
    #[serde(default)]
    pub error: String,
}

impl TranslationResult {
    /// Reject results that carry an error or no CAQL
    pub fn validate(self, query: &str) -> Result<Self, TranslationError> {
        if !self.error.is_empty() {
            return Err(TranslationError::Service {
                query: query.to_string(),
                message: self.error,
            });
        }
        if self.caql.is_empty() {
            return Err(TranslationError::EmptyResult {
                query: query.to_string(),
            });
        }
        Ok(self)
    }
}

/// The translator rejects whitespace inside graphite expressions
pub fn strip_whitespace(query: &str) -> String {
    query.chars().filter(|c| !c.is_whitespace()).collect()
}

// ----------------------------------------------------------------------------
// 9.2 Translation Service Trait
// ----------------------------------------------------------------------------

/// Turns a graphite query into CAQL
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TranslationService: Send + Sync {
    async fn translate(&self, query: &str) -> Result<TranslationResult, TranslationError>;
}

// ----------------------------------------------------------------------------
// 9.3 HTTP Gateway
// ----------------------------------------------------------------------------

/// Calls the IRONdb `graphite_translate` extension
pub struct TranslationGateway {
    client: HttpClient,
    url: Url,
    headers: HeaderMap,
    debug: bool,
}

impl TranslationGateway {
    pub fn new(client: HttpClient, url: Url, headers: HeaderMap, debug: bool) -> Self {
        Self {
            client,
            url,
            headers,
            debug,
        }
    }

    pub fn from_config(client: HttpClient, config: &CirconusConfig, debug: bool) -> ConvertResult<Self> {
        Ok(Self::new(
            client,
            config.translate_url()?,
            config.request_headers(false)?,
            debug,
        ))
    }
}

impl Debug for TranslationGateway {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationGateway")
            .field("url", &self.url.as_str())
            .field("debug", &self.debug)
            .finish()
    }
}

#[async_trait]
impl TranslationService for TranslationGateway {
    async fn translate(&self, query: &str) -> Result<TranslationResult, TranslationError> {
        let stripped = strip_whitespace(query);
        let request = TranslateRequest { q: &stripped };
        if self.debug {
            log_json("Translation request", &request);
        }

        let started = Instant::now();
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TranslationError::Timeout {
                        endpoint: self.url.to_string(),
                    }
                } else {
                    TranslationError::Transport {
                        endpoint: self.url.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| TranslationError::Transport {
            endpoint: self.url.to_string(),
            message: e.to_string(),
        })?;

        let result: TranslationResult =
            serde_json::from_str(&body).map_err(|e| TranslationError::InvalidResponse {
                status,
                message: e.to_string(),
            })?;

        if self.debug {
            log_json("Translation response", &result);
        }
        trace!(
            target: "caql_convert::translate",
            status,
            duration_ms = started.elapsed().as_millis() as u64,
            "Translation call complete"
        );

        result.validate(&stripped)
    }
}

// ============================================================================
// SECTION 10: AGGREGATION REWRITER
// ============================================================================
// Scans translated CAQL for `graphite:find('<pattern>')` calls and turns
// those naming a StatsD aggregate into histogram queries:
//
//   graphite:find('app.latency.upper_90')
//     → find:histogram('app.latency') | percentile(90)
//
// Each call is planned on its own from a snapshot of the query, then all
// replacements are spliced in one pass.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Aggregation Settings
// ----------------------------------------------------------------------------

/// Read-only rewriting settings shared by every match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationConfig {
    pub enabled_aggregations: BTreeSet<String>,
    /// Period for `sum` fragments in seconds, 0 = none
    pub period: u64,
    pub flush_interval_secs: u64,
}

impl AggregationConfig {
    pub fn new(enabled_aggregations: BTreeSet<String>, period: u64, flush_interval_secs: u64) -> Self {
        Self {
            enabled_aggregations,
            period,
            flush_interval_secs,
        }
    }

    /// Nothing enabled: queries only receive the directive
    pub fn is_empty(&self) -> bool {
        self.enabled_aggregations.is_empty()
    }

    /// Fragment for a keyword that is both enabled and mappable
    pub fn fragment_for(&self, keyword: &str) -> Option<String> {
        if !self.enabled_aggregations.contains(keyword) {
            return None;
        }
        map_aggregation(keyword, self.period)
    }

    /// Prefix the `#min_period` directive unless the query already has one
    pub fn apply_directive(&self, query: &str) -> String {
        if query.starts_with(MIN_PERIOD_DIRECTIVE) {
            return query.to_string();
        }
        format!("{}{} {}", MIN_PERIOD_DIRECTIVE, self.flush_interval_secs, query)
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self::new(BTreeSet::new(), 0, DEFAULT_STATSD_FLUSH_INTERVAL_SECS)
    }
}

// ----------------------------------------------------------------------------
// 10.2 Match Scanning
// ----------------------------------------------------------------------------

/// `find('<pattern>')`, optionally namespaced by the translator
static METRIC_REFERENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:graphite:)?find\('([^']+)'\)").expect("metric reference pattern is valid")
});

/// One metric-reference call inside a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteMatch {
    /// Byte range of the full call in the scanned query
    pub span: Range<usize>,
    pub full_match: String,
    pub pattern: String,
}

impl RewriteMatch {
    /// Last dot-delimited segment, the aggregation keyword candidate
    pub fn candidate_keyword(&self) -> &str {
        self.pattern
            .rsplit_once('.')
            .map(|(_, last)| last)
            .unwrap_or(&self.pattern)
    }

    /// Pattern without its last segment, when there is more than one
    pub fn base_name(&self) -> Option<&str> {
        self.pattern
            .rsplit_once('.')
            .map(|(base, _)| base)
            .filter(|base| !base.is_empty())
    }
}

/// Find every metric-reference call together with its byte offsets
pub fn find_metric_references(query: &str) -> Vec<RewriteMatch> {
    METRIC_REFERENCE_RE
        .captures_iter(query)
        .filter_map(|caps| {
            let full = caps.get(0)?;
            let pattern = caps.get(1)?;
            Some(RewriteMatch {
                span: full.range(),
                full_match: full.as_str().to_string(),
                pattern: pattern.as_str().to_string(),
            })
        })
        .collect()
}

// ----------------------------------------------------------------------------
// 10.3 Rule Selection
// ----------------------------------------------------------------------------

/// Which rewrite rule fired for a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RewriteRule {
    /// Name suffix is an enabled aggregation
    SuffixMatch,
    /// Suffix unknown, but every series is tagged with an enabled aggregation
    TypeOnlyMatch,
    /// Left untouched
    Passthrough,
}

impl Display for RewriteRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RewriteRule::SuffixMatch => write!(f, "suffix"),
            RewriteRule::TypeOnlyMatch => write!(f, "type"),
            RewriteRule::Passthrough => write!(f, "passthrough"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewritePlan {
    pub rule: RewriteRule,
    pub replacement: String,
}

impl RewritePlan {
    fn histogram(rule: RewriteRule, name: &str, fragment: &str) -> Self {
        Self {
            rule,
            replacement: format!("find:histogram('{}') | {}", name, fragment),
        }
    }

    fn passthrough(m: &RewriteMatch) -> Self {
        Self {
            rule: RewriteRule::Passthrough,
            replacement: m.full_match.clone(),
        }
    }
}

/// Decide the replacement for one match. Pure; the first applicable rule wins.
pub fn plan_rewrite(m: &RewriteMatch, resolved: &ResolvedType, config: &AggregationConfig) -> RewritePlan {
    let candidate = m.candidate_keyword();

    if let Some(fragment) = config.fragment_for(candidate) {
        // count series keep the suffix as part of their identity
        if resolved.is_single("count") {
            return RewritePlan::histogram(RewriteRule::SuffixMatch, &m.pattern, &fragment);
        }
        if let Some(base) = m.base_name() {
            return RewritePlan::histogram(RewriteRule::SuffixMatch, base, &fragment);
        }
    }

    if let Some(fragment) = resolved.as_single().and_then(|t| config.fragment_for(t)) {
        return RewritePlan::histogram(RewriteRule::TypeOnlyMatch, &m.pattern, &fragment);
    }

    RewritePlan::passthrough(m)
}

/// Replace every match span with its plan, reading only from `query`
fn splice(query: &str, matches: &[RewriteMatch], plans: &[RewritePlan]) -> String {
    let mut out = String::with_capacity(query.len() + plans.len() * 32);
    let mut cursor = 0;
    for (m, plan) in matches.iter().zip(plans) {
        out.push_str(&query[cursor..m.span.start]);
        out.push_str(&plan.replacement);
        cursor = m.span.end;
    }
    out.push_str(&query[cursor..]);
    out
}

// ----------------------------------------------------------------------------
// 10.4 Rewriter
// ----------------------------------------------------------------------------

/// Rewrites StatsD aggregate references in translated CAQL
#[derive(Debug, Clone)]
pub struct AggregationRewriter {
    resolver: TagResolver,
    config: AggregationConfig,
}

impl AggregationRewriter {
    pub fn new(resolver: TagResolver, config: AggregationConfig) -> Self {
        Self { resolver, config }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Rewrite a translated query. Never fails: unresolvable matches are
    /// left as they are.
    pub async fn rewrite(&self, query: &str) -> String {
        if self.config.is_empty() {
            return self.config.apply_directive(query);
        }

        let matches = find_metric_references(query);
        if matches.is_empty() {
            return self.config.apply_directive(query);
        }

        let plans = join_all(matches.iter().map(|m| self.plan_match(m))).await;
        let rewritten = splice(query, &matches, &plans);
        self.config.apply_directive(&rewritten)
    }

    async fn plan_match(&self, m: &RewriteMatch) -> RewritePlan {
        let resolved = self.resolver.resolve_type(&m.pattern).await;
        let plan = plan_rewrite(m, &resolved, &self.config);
        debug!(
            target: "caql_convert::rewrite",
            pattern = %m.pattern,
            resolved = %resolved,
            rule = %plan.rule,
            "Planned metric rewrite"
        );
        plan
    }
}

// ============================================================================
// SECTION 11: CIRCONUS CLIENT
// ============================================================================

/// Translates graphite queries into CAQL with StatsD aggregates rewritten
pub struct CirconusClient {
    translator: Arc<dyn TranslationService>,
    rewriter: AggregationRewriter,
}

impl Debug for CirconusClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CirconusClient")
            .field("rewriter", &self.rewriter)
            .finish_non_exhaustive()
    }
}

impl CirconusClient {
    pub fn new(translator: Arc<dyn TranslationService>, rewriter: AggregationRewriter) -> Self {
        Self {
            translator,
            rewriter,
        }
    }

    /// Build the HTTP gateway and tag index from configuration.
    /// Both share one connection pool.
    pub fn from_config(config: &CirconusConfig, debug: bool) -> ConvertResult<Self> {
        let http = config.http_client()?;
        let translate_url = config.translate_url()?;
        let gateway = TranslationGateway::from_config(http.clone(), config, debug)?;
        let index = CirconusTagIndex::from_config(http, config, debug)?;
        let rewriter = AggregationRewriter::new(
            TagResolver::with_index(Arc::new(index)),
            config.aggregation_config(),
        );

        info!(
            target: "caql_convert::circonus",
            translate_url = %translate_url,
            direct_irondb = config.direct_irondb,
            aggregations = rewriter.config().enabled_aggregations.len(),
            "Circonus client ready"
        );

        Ok(Self::new(Arc::new(gateway), rewriter))
    }

    /// Translate a graphite query and rewrite its aggregates
    pub async fn translate(&self, graphite: &str) -> Result<String, TranslationError> {
        let result = self.translator.translate(graphite).await?;
        Ok(self.rewriter.rewrite(&result.caql).await)
    }
}

// ============================================================================
// SECTION 12: GRAFANA CLIENT
// ============================================================================
// Thin wrapper over the Grafana HTTP API: folder search, dashboard fetch,
// folder creation and dashboard upload.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 API Types
// ----------------------------------------------------------------------------

/// Folder entry from `api/search` or `api/folders`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderSummary {
    pub id: i64,
    #[serde(default)]
    pub uid: String,
    pub title: String,
}

/// Dashboard entry from `api/search`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub uid: String,
    pub title: String,
    #[serde(default)]
    pub url: String,
}

/// Pick the one folder whose title is exactly `name`
pub fn select_folder(name: &str, folders: Vec<FolderSummary>) -> GrafanaResult<FolderSummary> {
    let mut exact: Vec<FolderSummary> = folders.into_iter().filter(|f| f.title == name).collect();
    match exact.len() {
        0 => Err(GrafanaError::FolderNotFound {
            name: name.to_string(),
        }),
        1 => Ok(exact.remove(0)),
        count => Err(GrafanaError::AmbiguousFolder {
            name: name.to_string(),
            count,
        }),
    }
}

/// Strip identity so Grafana files the dashboard as new in the target folder
pub fn prepare_for_upload(mut dashboard: JsonValue) -> JsonValue {
    if let Some(object) = dashboard.as_object_mut() {
        object.insert("id".into(), JsonValue::Null);
        object.remove("uid");
    }
    dashboard
}

// ----------------------------------------------------------------------------
// 12.2 Client
// ----------------------------------------------------------------------------

pub struct GrafanaClient {
    client: HttpClient,
    base: Url,
    headers: HeaderMap,
    debug: bool,
}

impl Debug for GrafanaClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrafanaClient")
            .field("base", &self.base.as_str())
            .field("debug", &self.debug)
            .finish()
    }
}

impl GrafanaClient {
    pub fn new(client: HttpClient, base: Url, headers: HeaderMap, debug: bool) -> Self {
        Self {
            client,
            base,
            headers,
            debug,
        }
    }

    pub fn from_config(config: &GrafanaConfig, debug: bool) -> ConvertResult<Self> {
        let client = build_http_client(config.timeout, 4)?;
        Ok(Self::new(client, config.base_url()?, config.request_headers()?, debug))
    }

    fn endpoint(&self, path: &str) -> GrafanaResult<Url> {
        self.base.join(path).map_err(|e| GrafanaError::Request {
            endpoint: path.to_string(),
            message: e.to_string(),
        })
    }

    async fn decode<T: DeserializeOwned>(url: &Url, response: reqwest::Response) -> GrafanaResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GrafanaError::Status {
                endpoint: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        response.json().await.map_err(|e| GrafanaError::InvalidResponse {
            endpoint: url.to_string(),
            message: e.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> GrafanaResult<T> {
        let url = self.endpoint(path)?;
        trace!(target: "caql_convert::grafana", url = %url, "GET");
        let response = self
            .client
            .get(url.clone())
            .headers(self.headers.clone())
            .query(query)
            .send()
            .await
            .map_err(|e| GrafanaError::Request {
                endpoint: url.to_string(),
                message: e.to_string(),
            })?;
        Self::decode(&url, response).await
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &JsonValue) -> GrafanaResult<T> {
        let url = self.endpoint(path)?;
        trace!(target: "caql_convert::grafana", url = %url, "POST");
        let response = self
            .client
            .post(url.clone())
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| GrafanaError::Request {
                endpoint: url.to_string(),
                message: e.to_string(),
            })?;
        Self::decode(&url, response).await
    }

    /// Find the single folder titled `name`
    pub async fn find_folder(&self, name: &str) -> GrafanaResult<FolderSummary> {
        let folders: Vec<FolderSummary> = self
            .get_json(
                "api/search",
                &[("type", "dash-folder".into()), ("query", name.to_string())],
            )
            .await?;
        if self.debug {
            log_json("Folder search", &folders);
        }
        select_folder(name, folders)
    }

    /// Find the folder titled `name`, creating it when missing
    pub async fn find_or_create_folder(&self, name: &str) -> GrafanaResult<FolderSummary> {
        match self.find_folder(name).await {
            Err(GrafanaError::FolderNotFound { .. }) => {
                info!(target: "caql_convert::grafana", folder = %name, "Creating destination folder");
                self.post_json("api/folders", &json!({ "title": name })).await
            }
            other => other,
        }
    }

    pub async fn list_dashboards(&self, folder_id: i64) -> GrafanaResult<Vec<DashboardSummary>> {
        let dashboards: Vec<DashboardSummary> = self
            .get_json(
                "api/search",
                &[("type", "dash-db".into()), ("folderIds", folder_id.to_string())],
            )
            .await?;
        if self.debug {
            log_json("Dashboards in folder", &dashboards);
        }
        Ok(dashboards)
    }

    /// Fetch the dashboard model (the `dashboard` member of the response)
    pub async fn get_dashboard(&self, uid: &str) -> GrafanaResult<JsonValue> {
        let path = format!("api/dashboards/uid/{}", uid);
        let mut response: JsonValue = self.get_json(&path, &[]).await?;
        match response.get_mut("dashboard").map(JsonValue::take) {
            Some(dashboard) if dashboard.is_object() => Ok(dashboard),
            _ => Err(GrafanaError::InvalidResponse {
                endpoint: path,
                message: "response has no dashboard object".into(),
            }),
        }
    }

    pub async fn upload_dashboard(&self, dashboard: JsonValue, folder: &FolderSummary) -> GrafanaResult<()> {
        let body = json!({
            "dashboard": prepare_for_upload(dashboard),
            "folderId": folder.id,
            "folderUid": folder.uid,
            "overwrite": true,
            "message": format!("Converted to CAQL by {} {}", CONVERTER_NAME, CONVERTER_VERSION),
        });
        if self.debug {
            log_json("Dashboard upload", &body);
        }
        let _: JsonValue = self.post_json("api/dashboards/db", &body).await?;
        Ok(())
    }
}

// ============================================================================
// SECTION 13: DASHBOARD CONVERSION
// ============================================================================
// Plan every target of every fetched dashboard, convert them through a
// bounded worker pool, write the results back and upload.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Planning
// ----------------------------------------------------------------------------

/// Which member of a panel target holds the query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetField {
    /// Expanded query with referenced series inlined
    TargetFull,
    Target,
}

impl TargetField {
    pub fn key(&self) -> &'static str {
        match self {
            TargetField::TargetFull => "targetFull",
            TargetField::Target => "target",
        }
    }
}

/// One query to translate, addressed by JSON pointer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetJob {
    /// Index into the fetched dashboards
    pub dashboard: usize,
    pub panel_pointer: String,
    pub target_pointer: String,
    pub field: TargetField,
    pub query: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DashboardPlan {
    pub jobs: Vec<TargetJob>,
    /// Targets with nothing to translate
    pub skipped: usize,
}

/// Whether a panel datasource is one of the configured graphite sources.
/// Panels on the dashboard default (no datasource) always qualify.
pub fn datasource_matches(datasource: Option<&JsonValue>, filter: &[String]) -> bool {
    if filter.is_empty() {
        return true;
    }
    let listed = |name: &str| filter.iter().any(|f| f == name);
    match datasource {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(name)) => listed(name),
        Some(JsonValue::Object(object)) => ["uid", "type", "name"]
            .iter()
            .filter_map(|key| object.get(*key).and_then(JsonValue::as_str))
            .any(listed),
        Some(_) => false,
    }
}

fn collect_panels(dashboard: &JsonValue, pointer: &str, out: &mut Vec<String>) {
    let Some(panels) = dashboard.pointer(pointer).and_then(JsonValue::as_array) else {
        return;
    };
    for (i, panel) in panels.iter().enumerate() {
        let panel_pointer = format!("{}/{}", pointer, i);
        // collapsed rows carry their children
        if panel.get("panels").map_or(false, JsonValue::is_array) {
            collect_panels(dashboard, &format!("{}/panels", panel_pointer), out);
        }
        out.push(panel_pointer);
    }
}

/// JSON pointers of every panel, including row children and legacy rows
pub fn panel_pointers(dashboard: &JsonValue) -> Vec<String> {
    let mut pointers = Vec::new();
    collect_panels(dashboard, "/panels", &mut pointers);
    if let Some(rows) = dashboard.get("rows").and_then(JsonValue::as_array) {
        for i in 0..rows.len() {
            collect_panels(dashboard, &format!("/rows/{}/panels", i), &mut pointers);
        }
    }
    pointers
}

/// Collect the translation jobs of one dashboard
pub fn plan_dashboard(index: usize, dashboard: &JsonValue, datasources: &[String]) -> DashboardPlan {
    let mut plan = DashboardPlan::default();

    for panel_pointer in panel_pointers(dashboard) {
        let Some(panel) = dashboard.pointer(&panel_pointer) else {
            continue;
        };
        if !datasource_matches(panel.get("datasource"), datasources) {
            continue;
        }
        let Some(targets) = panel.get("targets").and_then(JsonValue::as_array) else {
            continue;
        };

        for (i, target) in targets.iter().enumerate() {
            let text = |field: TargetField| {
                target
                    .get(field.key())
                    .and_then(JsonValue::as_str)
                    .filter(|s| !s.trim().is_empty())
            };
            let (field, query) = match (text(TargetField::TargetFull), text(TargetField::Target)) {
                (Some(full), _) => (TargetField::TargetFull, full),
                (None, Some(target)) => (TargetField::Target, target),
                (None, None) => {
                    plan.skipped += 1;
                    continue;
                }
            };
            plan.jobs.push(TargetJob {
                dashboard: index,
                panel_pointer: panel_pointer.clone(),
                target_pointer: format!("{}/targets/{}", panel_pointer, i),
                field,
                query: query.to_string(),
            });
        }
    }

    plan
}

/// Write a converted query back. `targetFull` wins and clears `target`.
pub fn apply_translation(dashboard: &mut JsonValue, job: &TargetJob, caql: &str) -> bool {
    let Some(target) = dashboard
        .pointer_mut(&job.target_pointer)
        .and_then(JsonValue::as_object_mut)
    else {
        return false;
    };
    target.insert(job.field.key().into(), JsonValue::String(caql.to_string()));
    if job.field == TargetField::TargetFull {
        target.insert(TargetField::Target.key().into(), JsonValue::String(String::new()));
    }
    true
}

/// Point a converted panel at the CAQL datasource
pub fn retarget_panel(dashboard: &mut JsonValue, panel_pointer: &str, datasource: &str) -> bool {
    match dashboard
        .pointer_mut(panel_pointer)
        .and_then(JsonValue::as_object_mut)
    {
        Some(panel) => {
            panel.insert("datasource".into(), JsonValue::String(datasource.to_string()));
            true
        }
        None => false,
    }
}

// ----------------------------------------------------------------------------
// 13.2 Conversion Pool
// ----------------------------------------------------------------------------

/// Result of one target conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Converted(String),
    Failed(String),
    /// Interrupted before completion, target left untouched
    Cancelled,
}

/// Translate every job with at most `concurrency` in flight. Outcomes are
/// returned in job order.
pub async fn convert_targets(
    client: Arc<CirconusClient>,
    jobs: &[TargetJob],
    concurrency: usize,
    cancel: CancellationToken,
) -> Vec<TargetOutcome> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut join_set = JoinSet::new();

    for (index, job) in jobs.iter().enumerate() {
        let client = client.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let query = job.query.clone();
        let target = job.target_pointer.clone();

        join_set.spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => TargetOutcome::Cancelled,
                outcome = async {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return TargetOutcome::Cancelled;
                    };
                    match client.translate(&query).await {
                        Ok(caql) => TargetOutcome::Converted(caql),
                        Err(e) => {
                            error!(
                                target: "caql_convert::convert",
                                target_pointer = %target,
                                query = %query,
                                error = %e,
                                "Translation failed, target left unchanged"
                            );
                            TargetOutcome::Failed(e.to_string())
                        }
                    }
                } => outcome,
            };
            (index, outcome)
        });
    }

    let mut outcomes = vec![TargetOutcome::Cancelled; jobs.len()];
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, outcome)) => outcomes[index] = outcome,
            Err(e) => error!(target: "caql_convert::convert", error = %e, "Conversion task aborted"),
        }
    }
    outcomes
}

// ----------------------------------------------------------------------------
// 13.3 Report
// ----------------------------------------------------------------------------

/// Summary of a conversion run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversionReport {
    pub dashboards: usize,
    pub targets_converted: usize,
    pub targets_failed: usize,
    pub targets_skipped: usize,
    pub targets_cancelled: usize,
    pub panels_retargeted: usize,
    pub uploaded: usize,
    pub upload_failures: usize,
    pub cancelled: bool,
}

impl ConversionReport {
    pub fn log_summary(&self, elapsed: Duration) {
        info!(
            target: "caql_convert::convert",
            dashboards = self.dashboards,
            converted = self.targets_converted,
            failed = self.targets_failed,
            skipped = self.targets_skipped,
            cancelled = self.targets_cancelled,
            panels = self.panels_retargeted,
            uploaded = self.uploaded,
            upload_failures = self.upload_failures,
            elapsed = %humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64)),
            "Conversion finished"
        );
    }

    /// Tally outcomes and write converted queries back into the dashboards
    pub fn apply_outcomes(
        &mut self,
        dashboards: &mut [JsonValue],
        jobs: &[TargetJob],
        outcomes: &[TargetOutcome],
        circonus_datasource: &str,
    ) {
        let mut converted_panels: BTreeSet<(usize, &str)> = BTreeSet::new();

        for (job, outcome) in jobs.iter().zip(outcomes) {
            match outcome {
                TargetOutcome::Converted(caql) => {
                    let Some(dashboard) = dashboards.get_mut(job.dashboard) else {
                        continue;
                    };
                    if apply_translation(dashboard, job, caql) {
                        self.targets_converted += 1;
                        converted_panels.insert((job.dashboard, job.panel_pointer.as_str()));
                    }
                }
                TargetOutcome::Failed(_) => self.targets_failed += 1,
                TargetOutcome::Cancelled => self.targets_cancelled += 1,
            }
        }

        if circonus_datasource.is_empty() {
            return;
        }
        for (index, pointer) in converted_panels {
            if let Some(dashboard) = dashboards.get_mut(index) {
                if retarget_panel(dashboard, pointer, circonus_datasource) {
                    self.panels_retargeted += 1;
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 13.4 Converter
// ----------------------------------------------------------------------------

/// Drives a full folder conversion
#[derive(Debug)]
pub struct DashboardConverter {
    grafana: GrafanaClient,
    circonus: Arc<CirconusClient>,
    config: GrafanaConfig,
    concurrency: usize,
}

impl DashboardConverter {
    pub fn new(
        grafana: GrafanaClient,
        circonus: Arc<CirconusClient>,
        config: GrafanaConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            grafana,
            circonus,
            config,
            concurrency,
        }
    }

    pub fn from_config(config: &ConverterConfig) -> ConvertResult<Self> {
        let grafana = GrafanaClient::from_config(&config.grafana, config.debug)?;
        let circonus = CirconusClient::from_config(&config.circonus, config.debug)?;
        Ok(Self::new(
            grafana,
            Arc::new(circonus),
            config.grafana.clone(),
            config.circonus.concurrency,
        ))
    }

    async fn fetch_dashboards(&self, folder: &FolderSummary) -> GrafanaResult<Vec<(DashboardSummary, JsonValue)>> {
        let summaries = self.grafana.list_dashboards(folder.id).await?;
        let fetched = join_all(summaries.iter().map(|s| self.grafana.get_dashboard(&s.uid))).await;
        summaries
            .into_iter()
            .zip(fetched)
            .map(|(summary, dashboard)| dashboard.map(|d| (summary, d)))
            .collect()
    }

    /// Convert every dashboard in the source folder. Cancellation skips the
    /// upload; a dry run prints the converted dashboards instead.
    pub async fn run(&self, dry_run: bool, cancel: CancellationToken) -> ConvertResult<ConversionReport> {
        let started = Instant::now();
        let mut report = ConversionReport::default();

        let source = self.grafana.find_folder(&self.config.src_folder).await?;
        info!(
            target: "caql_convert::convert",
            folder = %source.title,
            id = source.id,
            "Found source folder"
        );

        let (summaries, mut dashboards): (Vec<DashboardSummary>, Vec<JsonValue>) =
            self.fetch_dashboards(&source).await?.into_iter().unzip();
        report.dashboards = dashboards.len();

        let mut jobs = Vec::new();
        for (index, dashboard) in dashboards.iter().enumerate() {
            let plan = plan_dashboard(index, dashboard, &self.config.graphite_datasources);
            debug!(
                target: "caql_convert::convert",
                dashboard = %summaries[index].title,
                targets = plan.jobs.len(),
                skipped = plan.skipped,
                "Planned dashboard"
            );
            report.targets_skipped += plan.skipped;
            jobs.extend(plan.jobs);
        }

        let outcomes = convert_targets(self.circonus.clone(), &jobs, self.concurrency, cancel.clone()).await;
        report.apply_outcomes(&mut dashboards, &jobs, &outcomes, &self.config.circonus_datasource);

        if cancel.is_cancelled() {
            warn!(target: "caql_convert::convert", "Conversion interrupted, nothing uploaded");
            report.cancelled = true;
            report.log_summary(started.elapsed());
            return Ok(report);
        }

        if dry_run {
            for dashboard in &dashboards {
                let pretty = serde_json::to_string_pretty(dashboard)
                    .map_err(|e| ConvertError::Internal(format!("Failed to render dashboard: {}", e)))?;
                println!("{}", pretty);
            }
            report.log_summary(started.elapsed());
            return Ok(report);
        }

        let destination = self.grafana.find_or_create_folder(&self.config.dest_folder).await?;
        for (summary, dashboard) in summaries.iter().zip(dashboards) {
            match self.grafana.upload_dashboard(dashboard, &destination).await {
                Ok(()) => {
                    info!(
                        target: "caql_convert::convert",
                        dashboard = %summary.title,
                        folder = %destination.title,
                        "Uploaded dashboard"
                    );
                    report.uploaded += 1;
                }
                Err(e) => {
                    error!(
                        target: "caql_convert::convert",
                        dashboard = %summary.title,
                        error = %e,
                        "Dashboard upload failed"
                    );
                    report.upload_failures += 1;
                }
            }
        }

        report.log_summary(started.elapsed());
        Ok(report)
    }
}

// ============================================================================
// SECTION 14: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// caql-convert CLI
#[derive(Parser, Debug)]
#[command(
    name = "caql-convert",
    version,
    about = "Convert Grafana Graphite dashboards to Circonus CAQL",
    long_about = "Translates every Graphite target of the dashboards in a Grafana folder \
                  into CAQL, rewrites StatsD aggregation suffixes into histogram functions \
                  and uploads the result into a destination folder."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CAQL_CONVERT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level override
    #[arg(short, long, env = "CAQL_CONVERT_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log API requests and responses
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Convert the source folder's dashboards (default)
    Convert {
        /// Print converted dashboards instead of uploading them
        #[arg(long)]
        dry_run: bool,
    },

    /// Translate a single graphite query and print the CAQL
    Translate {
        query: String,
    },

    /// Print the effective configuration
    ShowConfig {
        #[arg(short, long, value_enum, default_value_t = ConfigFormat::Toml)]
        format: ConfigFormat,
    },

    /// Validate configuration
    Validate,

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

// ----------------------------------------------------------------------------
// 14.2 CLI Handler Functions
// ----------------------------------------------------------------------------

fn handle_version() {
    println!("{} v{}", CONVERTER_FULL_NAME, CONVERTER_VERSION);
    println!();
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
}

fn handle_generate_config(output: Option<&Path>) -> ConvertResult<()> {
    let config_str = ConverterConfig::generate_default_config()?;

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

fn handle_show_config(config: &ConverterConfig, format: ConfigFormat) -> ConvertResult<()> {
    println!("{}", config.redacted().render(format)?);
    Ok(())
}

fn handle_validate(config: &ConverterConfig, path: Option<&Path>) -> ConvertResult<()> {
    match path {
        Some(path) => println!("Validating configuration: {}", path.display()),
        None => println!("Validating configuration from defaults and environment"),
    }

    match config.validate() {
        Ok(()) => {
            println!("Configuration is valid");
            println!("  • Circonus: {}", config.circonus.translate_url()?);
            println!("  • Grafana: {}", config.grafana.base_url()?);
            println!("  • Folders: {} -> {}", config.grafana.src_folder, config.grafana.dest_folder);
            println!(
                "  • Aggregations: {}",
                config.circonus.aggregation_config().enabled_aggregations.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed: {}", e);
            Err(ConvertError::Config(e))
        }
    }
}

async fn handle_translate(config: &ConverterConfig, query: &str) -> ConvertResult<()> {
    config.circonus.validate()?;
    let client = CirconusClient::from_config(&config.circonus, config.debug)?;
    let caql = client.translate(query).await?;
    println!("{}", caql);
    Ok(())
}

async fn handle_convert(config: &ConverterConfig, dry_run: bool) -> ConvertResult<ConversionReport> {
    config.validate()?;
    let converter = DashboardConverter::from_config(config)?;

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(target: "caql_convert::convert", "Interrupt received, cancelling conversions");
            watcher.cancel();
        }
    });

    let report = converter.run(dry_run, cancel.clone()).await;
    cancel.cancel();
    report
}

// ============================================================================
// SECTION 15: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Handle subcommands that don't need configuration
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        _ => {}
    }

    let config_path = resolve_config_path(cli.config.as_deref());
    let mut config = ConverterConfig::load_or_default(config_path.as_deref()).with_context(|| {
        match &config_path {
            Some(path) => format!("Failed to load config from {}", path.display()),
            None => "Failed to load default config".to_string(),
        }
    })?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        config.debug = true;
        logging_config.level = "debug".into();
    }

    let _log_guard = init_logging(&logging_config)?;

    let outcome = match cli.command {
        Some(Commands::ShowConfig { format }) => handle_show_config(&config, format),
        Some(Commands::Validate) => handle_validate(&config, config_path.as_deref()),
        Some(Commands::Translate { query }) => handle_translate(&config, &query).await,
        Some(Commands::Convert { dry_run }) => handle_convert(&config, dry_run).await.map(|_| ()),
        None => handle_convert(&config, false).await.map(|_| ()),
        // handled before configuration was loaded
        Some(Commands::Version) | Some(Commands::GenerateConfig { .. }) => Ok(()),
    };

    if let Err(e) = outcome {
        report_failure(&e);
        return Err(e.into());
    }

    Ok(())
}

/// Log a command failure with its category before exiting
fn report_failure(err: &ConvertError) {
    error!(
        target: "caql_convert::main",
        category = err.category(),
        recoverable = err.is_recoverable(),
        error = %err,
        "Command failed"
    );
}

// ============================================================================
// SECTION 16: TESTS
// ============================================================================
