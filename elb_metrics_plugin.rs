//! # ELB Metrics Plugin
//!
//! Polls the CloudWatch metrics of one AWS Elastic Load Balancer and prints
//! the latest values in the mackerel-agent plugin format.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         ELB METRICS PLUGIN                           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  DISCOVERY → TOPOLOGY → SNAPSHOT ASSEMBLER ┐                         │
//! │                       └ SCHEMA BUILDER ────┴→ AGENT OUTPUT (stdout)   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Availability zones are discovered once per run from the CloudWatch
//! catalog. The same topology then drives both the metric snapshot and the
//! graph definitions, so the two key spaces always line up.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, HashMap, HashSet};
use std::env;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, instrument, trace, warn};
use tracing_subscriber::{fmt as fmt_layer, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// AWS CloudWatch
// ----------------------------------------------------------------------------
use aws_config::meta::region::RegionProviderChain;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_cloudwatch::error::{DisplayErrorContext, SdkError};
use aws_sdk_cloudwatch::primitives::DateTime as AwsDateTime;
use aws_sdk_cloudwatch::types::{
    Dimension as AwsDimension, DimensionFilter as AwsDimensionFilter, Statistic,
};
use aws_sdk_cloudwatch::Client as CloudWatchClient;

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
use clap::Parser;

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Plugin version - follows semantic versioning
pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PLUGIN_NAME: &str = "mackerel-plugin-aws-elb";

// ----------------------------------------------------------------------------
// CloudWatch Namespace & Dimensions
// ----------------------------------------------------------------------------

/// CloudWatch namespace holding classic load balancer metrics
pub const ELB_NAMESPACE: &str = "AWS/ELB";

/// Dimension name that scopes a metric to one availability zone
pub const ZONE_DIMENSION: &str = "AvailabilityZone";

/// Service-wide dimension used for metrics aggregated over the whole ELB
pub const SERVICE_DIMENSION_NAME: &str = "Service";
pub const SERVICE_DIMENSION_VALUE: &str = "ELB";

// ----------------------------------------------------------------------------
// Query Window
// ----------------------------------------------------------------------------

/// Look-back window for every statistics request (seconds).
/// Two periods, so at least one bucket exists despite reporting delay.
pub const LOOKBACK_SECS: i64 = 120;

/// Aggregation period for every statistics request (seconds)
pub const PERIOD_SECS: i32 = 60;

// ----------------------------------------------------------------------------
// Metric Names
// ----------------------------------------------------------------------------

pub const HEALTHY_HOST_COUNT: &str = "HealthyHostCount";
pub const UNHEALTHY_HOST_COUNT: &str = "UnHealthyHostCount";
pub const LATENCY: &str = "Latency";

/// Per-zone host count metrics, always fetched with `Average`
pub const HOST_COUNT_METRICS: [&str; 2] = [HEALTHY_HOST_COUNT, UNHEALTHY_HOST_COUNT];

/// Backend HTTP status-class counters with their display labels, always `Sum`
pub const HTTP_BACKEND_METRICS: [(&str, &str); 4] = [
    ("HTTPCode_Backend_2XX", "2XX"),
    ("HTTPCode_Backend_3XX", "3XX"),
    ("HTTPCode_Backend_4XX", "4XX"),
    ("HTTPCode_Backend_5XX", "5XX"),
];

// ----------------------------------------------------------------------------
// Graph Identifiers
// ----------------------------------------------------------------------------

pub const GRAPH_LATENCY: &str = "elb.latency";
pub const GRAPH_HTTP_BACKEND: &str = "elb.http_backend";
pub const GRAPH_HEALTHY_HOST_COUNT: &str = "elb.healthy_host_count";
pub const GRAPH_UNHEALTHY_HOST_COUNT: &str = "elb.unhealthy_host_count";

// ----------------------------------------------------------------------------
// Agent Protocol
// ----------------------------------------------------------------------------

/// Set (non-empty) by mackerel-agent when it wants graph definitions
pub const PLUGIN_META_ENV: &str = "MACKEREL_AGENT_PLUGIN_META";

/// First line of a graph definition response
pub const PLUGIN_META_HEADER: &str = "# mackerel-agent-plugin";

/// Default location of the persisted state file
pub const DEFAULT_TEMPFILE: &str = "/tmp/mackerel-plugin-elb";

/// Key holding the previous run's timestamp inside the state file
pub const STATE_LAST_TIME_KEY: &str = "_lastTime";

/// Diff metrics are dropped when the previous sample is older than this
pub const MAX_DIFF_ELAPSED_SECS: i64 = 600;

// ----------------------------------------------------------------------------
// Fetch Concurrency & Timeouts
// ----------------------------------------------------------------------------

/// Default number of statistics requests in flight
pub const DEFAULT_FETCH_CONCURRENCY: usize = 4;

/// Upper bound on concurrent statistics requests
pub const MAX_FETCH_CONCURRENCY: usize = 32;

/// Default per-operation timeout for CloudWatch calls (seconds)
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 10;

/// Prefix for environment overrides (`ELB_PLUGIN_AWS__REGION`, ...)
pub const ENV_PREFIX: &str = "ELB_PLUGIN_";

/// Provider name attached to statically configured credentials
const STATIC_CREDENTIALS_PROVIDER: &str = "elb-plugin-static";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Value types shared by discovery, fetching, schema generation and output.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Dimension
// ----------------------------------------------------------------------------

/// A name/value coordinate that scopes a metric to a sub-resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// `AvailabilityZone=<zone>`
    pub fn zone(zone: impl Into<String>) -> Self {
        Self::new(ZONE_DIMENSION, zone)
    }

    /// `Service=ELB`
    pub fn service() -> Self {
        Self::new(SERVICE_DIMENSION_NAME, SERVICE_DIMENSION_VALUE)
    }
}

impl Display for Dimension {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Statistic Kind
// ----------------------------------------------------------------------------

/// Aggregation requested from CloudWatch over one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatKind {
    Average,
    Sum,
}

impl StatKind {
    /// Name used on the wire
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            StatKind::Average => "Average",
            StatKind::Sum => "Sum",
        }
    }

    fn to_statistic(self) -> Statistic {
        match self {
            StatKind::Average => Statistic::Average,
            StatKind::Sum => Statistic::Sum,
        }
    }
}

impl Display for StatKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

// ----------------------------------------------------------------------------
// 3.3 Queries, Data Points & Catalog Entries
// ----------------------------------------------------------------------------

/// One statistics request against the ELB namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricQuery {
    pub dimension: Dimension,
    pub metric_name: String,
    pub stat: StatKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period_secs: i32,
}

impl MetricQuery {
    /// Query for the most recent buckets ending at `now`.
    pub fn latest(
        dimension: Dimension,
        metric_name: impl Into<String>,
        stat: StatKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            dimension,
            metric_name: metric_name.into(),
            stat,
            start: now - chrono::Duration::seconds(LOOKBACK_SECS),
            end: now,
            period_secs: PERIOD_SECS,
        }
    }
}

/// A single sample returned for a statistics request.
///
/// CloudWatch only fills the statistics that were asked for, so each field
/// is optional.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub average: Option<f64>,
    pub sum: Option<f64>,
}

impl DataPoint {
    /// Field matching `stat`
    pub fn value(&self, stat: StatKind) -> Option<f64> {
        match stat {
            StatKind::Average => self.average,
            StatKind::Sum => self.sum,
        }
    }
}

/// A series listed by the metrics catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSeries {
    pub metric_name: String,
    pub dimensions: Vec<Dimension>,
}

// ----------------------------------------------------------------------------
// 3.4 Topology
// ----------------------------------------------------------------------------

/// Availability zones discovered for the load balancer, in catalog order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    zones: Vec<String>,
}

impl Topology {
    pub fn new(zones: Vec<String>) -> Self {
        Self { zones }
    }

    pub fn zones(&self) -> &[String] {
        &self.zones
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.zones.iter().map(String::as_str)
    }
}

impl FromIterator<String> for Topology {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

// ----------------------------------------------------------------------------
// 3.5 Snapshot
// ----------------------------------------------------------------------------

/// One polling cycle's resolved metric values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(HashMap<String, f64>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn as_map(&self) -> &HashMap<String, f64> {
        &self.0
    }

    pub fn into_inner(self) -> HashMap<String, f64> {
        self.0
    }
}

impl FromIterator<(String, f64)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Snapshot key for a per-zone metric
pub fn zone_metric_key(metric_name: &str, zone: &str) -> String {
    format!("{metric_name}_{zone}")
}

// ----------------------------------------------------------------------------
// 3.6 Graph Schema
// ----------------------------------------------------------------------------

/// Unit a graph is rendered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphUnit {
    Float,
    Integer,
}

/// One line on a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphMetric {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub diff: bool,
    #[serde(default)]
    pub stacked: bool,
}

impl GraphMetric {
    pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            diff: false,
            stacked: false,
        }
    }

    pub fn stacked(mut self) -> Self {
        self.stacked = true;
        self
    }

    pub fn diff(mut self) -> Self {
        self.diff = true;
        self
    }
}

/// A group of metrics drawn together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub label: String,
    pub unit: GraphUnit,
    pub metrics: Vec<GraphMetric>,
}

/// Graph id → graph, ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphSchema(BTreeMap<String, Graph>);

impl GraphSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new schema with `graphs` added, replacing ids already present.
    pub fn with_graphs<I>(mut self, graphs: I) -> Self
    where
        I: IntoIterator<Item = (String, Graph)>,
    {
        self.0.extend(graphs);
        self
    }

    pub fn get(&self, id: &str) -> Option<&Graph> {
        self.0.get(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Graph)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Every metric name referenced by any graph
    pub fn member_names(&self) -> HashSet<&str> {
        self.0
            .values()
            .flat_map(|g| g.metrics.iter().map(|m| m.name.as_str()))
            .collect()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Fatal errors (configuration, discovery, output) abort the run. Per-series
// fetch failures are absorbed by the snapshot assembler and never reach the
// caller.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Plugin Errors
// ----------------------------------------------------------------------------

/// The main error type for the plugin.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Availability zone discovery failed: {0}")]
    Discovery(#[source] MetricsApiError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("Logging initialization failed: {0}")]
    Logging(String),
}

impl PluginError {
    /// Every error that reaches the top of a run is fatal; kept explicit so
    /// new variants have to decide.
    pub fn is_fatal(&self) -> bool {
        match self {
            PluginError::Config(_) => true,
            PluginError::Discovery(_) => true,
            PluginError::Output(_) => true,
            PluginError::Logging(_) => true,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            PluginError::Config(_) => "config",
            PluginError::Discovery(_) => "discovery",
            PluginError::Output(_) => "output",
            PluginError::Logging(_) => "logging",
        }
    }
}

pub type PluginResult<T> = Result<T, PluginError>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
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
// 4.3 Metrics API Errors
// ----------------------------------------------------------------------------

/// Failure of a single metrics API call. "No data" is not an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricsApiError {
    #[error("{operation} request failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
}

impl MetricsApiError {
    pub fn request(operation: &'static str, message: impl Into<String>) -> Self {
        MetricsApiError::Request {
            operation,
            message: message.into(),
        }
    }

    fn from_sdk<E, R>(operation: &'static str, err: SdkError<E, R>) -> Self
    where
        E: std::error::Error + 'static,
        R: Debug,
    {
        match &err {
            SdkError::TimeoutError(_) => MetricsApiError::Timeout { operation },
            _ => MetricsApiError::Request {
                operation,
                message: DisplayErrorContext(&err).to_string(),
            },
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Output Errors
// ----------------------------------------------------------------------------

/// Errors writing agent output or persisting state
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write state file {path}: {source}")]
    StateWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write agent output: {0}")]
    Write(#[from] io::Error),
}

/// Reasons a diff metric cannot be computed this run
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiffError {
    #[error("no previous value")]
    NoPreviousValue,

    #[error("previous sample is {elapsed_secs}s old")]
    TooLongDuration { elapsed_secs: i64 },

    #[error("no time elapsed since previous sample")]
    NoElapsedTime,

    #[error("counter went backwards ({last} -> {current})")]
    CounterReset { last: f64, current: f64 },
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - Compiled defaults
// - Optional TOML file
// - ELB_PLUGIN_* environment variables
// - CLI flags (applied by the entry point)
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for one plugin run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// AWS access
    #[serde(default)]
    pub aws: AwsConfig,

    /// Statistics fetching
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Agent output and state
    #[serde(default)]
    pub output: OutputConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PluginConfig {
    /// Merge defaults, an optional file and the environment.
    ///
    /// Not validated: CLI flags still apply on top, see [`Cli::load_config`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(PluginConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }

        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch.concurrency == 0 || self.fetch.concurrency > MAX_FETCH_CONCURRENCY {
            return Err(ConfigError::invalid_value(
                "fetch.concurrency",
                format!("must be between 1 and {MAX_FETCH_CONCURRENCY}"),
            ));
        }

        if self.aws.operation_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "aws.operation_timeout",
                "must be greater than zero",
            ));
        }

        let has_key = non_empty(&self.aws.access_key_id).is_some();
        let has_secret = non_empty(&self.aws.secret_access_key).is_some();
        if has_key != has_secret {
            return Err(ConfigError::invalid_value(
                "aws.access_key_id",
                "access key id and secret access key must be given together",
            ));
        }

        if self.output.tempfile.as_os_str().is_empty() {
            return Err(ConfigError::missing_field("output.tempfile"));
        }

        if parse_log_level(&self.logging.level).is_none() {
            return Err(ConfigError::invalid_value(
                "logging.level",
                format!("unknown level '{}'", self.logging.level),
            ));
        }

        if LogFormat::parse(&self.logging.format).is_none() {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("unknown format '{}'", self.logging.format),
            ));
        }

        Ok(())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

// ----------------------------------------------------------------------------
// 5.2 AWS Configuration
// ----------------------------------------------------------------------------

/// Region, credentials and transport settings
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AwsConfig {
    /// Empty means "resolve from the environment"
    #[serde(default)]
    pub region: String,

    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Endpoint override (local stand-ins, VPC endpoints)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Per-operation timeout, e.g. "10s"
    #[serde(default = "default_operation_timeout", with = "humantime_serde")]
    pub operation_timeout: Duration,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: String::new(),
            access_key_id: None,
            secret_access_key: None,
            endpoint_url: None,
            operation_timeout: default_operation_timeout(),
        }
    }
}

impl AwsConfig {
    /// Static key pair, when both halves are present
    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        Some((
            non_empty(&self.access_key_id)?,
            non_empty(&self.secret_access_key)?,
        ))
    }
}

// Keeps the secret out of logs.
impl Debug for AwsConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsConfig")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("endpoint_url", &self.endpoint_url)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

fn default_operation_timeout() -> Duration {
    Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// 5.3 Fetch Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Statistics requests in flight at once (1 = sequential)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    DEFAULT_FETCH_CONCURRENCY
}

// ----------------------------------------------------------------------------
// 5.4 Output Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// State file shared between runs
    #[serde(default = "default_tempfile")]
    pub tempfile: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            tempfile: default_tempfile(),
        }
    }
}

fn default_tempfile() -> PathBuf {
    PathBuf::from(DEFAULT_TEMPFILE)
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (compact, pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default)]
    pub colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: false,
        }
    }
}

fn default_log_level() -> String {
    "warn".into()
}

fn default_log_format() -> String {
    "compact".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// stdout belongs to the agent protocol, so every layer writes to stderr.
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

/// Level filter for a configured level name
pub fn parse_log_level(s: &str) -> Option<LevelFilter> {
    match s.to_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" => Some(LevelFilter::OFF),
        _ => None,
    }
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "compact" => Some(LogFormat::Compact),
            "pretty" => Some(LogFormat::Pretty),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> PluginResult<()> {
    let level_filter = parse_log_level(&config.level).ok_or_else(|| {
        PluginError::Config(ConfigError::invalid_value(
            "logging.level",
            format!("unknown level '{}'", config.level),
        ))
    })?;

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let installed = match LogFormat::parse(&config.format).unwrap_or(LogFormat::Compact) {
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt_layer::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt_layer::layer()
                    .pretty()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Compact => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt_layer::layer()
                    .compact()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.map_err(|e| PluginError::Logging(e.to_string()))?;

    debug!(
        target: "elb_plugin::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: METRICS API PORT & CLOUDWATCH ADAPTER
// ============================================================================
// The two catalog/statistics operations the core consumes. The CloudWatch
// adapter is the production implementation; tests substitute their own.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Metrics API Trait
// ----------------------------------------------------------------------------

/// Metrics backend operations used by discovery and fetching.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricsApi: Send + Sync {
    /// List series in `namespace` named `metric_name` that carry a dimension
    /// called `dimension_name`. All catalog pages are returned.
    async fn list_metrics(
        &self,
        namespace: &str,
        metric_name: &str,
        dimension_name: &str,
    ) -> Result<Vec<MetricSeries>, MetricsApiError>;

    /// Data points for `query` in the ELB namespace.
    async fn get_metric_statistics(
        &self,
        query: &MetricQuery,
    ) -> Result<Vec<DataPoint>, MetricsApiError>;
}

// ----------------------------------------------------------------------------
// 7.2 CloudWatch Adapter
// ----------------------------------------------------------------------------

/// CloudWatch-backed [`MetricsApi`].
#[derive(Debug, Clone)]
pub struct CloudWatchApi {
    client: CloudWatchClient,
}

impl CloudWatchApi {
    /// Build a client for an already resolved region.
    pub async fn connect(config: &AwsConfig) -> Result<Self, ConfigError> {
        if config.region.trim().is_empty() {
            return Err(ConfigError::missing_field("aws.region"));
        }

        let timeouts = TimeoutConfig::builder()
            .operation_timeout(config.operation_timeout)
            .build();

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .timeout_config(timeouts);

        if let Some((access_key_id, secret_access_key)) = config.static_credentials() {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                STATIC_CREDENTIALS_PROVIDER,
            ));
        }

        if let Some(url) = &config.endpoint_url {
            loader = loader.endpoint_url(url.clone());
        }

        let sdk_config = loader.load().await;

        info!(
            target: "elb_plugin::cloudwatch",
            region = %config.region,
            static_credentials = config.static_credentials().is_some(),
            "CloudWatch client configured"
        );

        Ok(Self {
            client: CloudWatchClient::new(&sdk_config),
        })
    }

    pub fn from_client(client: CloudWatchClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetricsApi for CloudWatchApi {
    async fn list_metrics(
        &self,
        namespace: &str,
        metric_name: &str,
        dimension_name: &str,
    ) -> Result<Vec<MetricSeries>, MetricsApiError> {
        let mut series = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_metrics()
                .namespace(namespace)
                .metric_name(metric_name)
                .dimensions(AwsDimensionFilter::builder().name(dimension_name).build())
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| MetricsApiError::from_sdk("ListMetrics", e))?;

            series.extend(response.metrics().iter().map(|metric| MetricSeries {
                metric_name: metric.metric_name().unwrap_or_default().to_string(),
                dimensions: metric
                    .dimensions()
                    .iter()
                    .map(|d| {
                        Dimension::new(d.name().unwrap_or_default(), d.value().unwrap_or_default())
                    })
                    .collect(),
            }));

            match response.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(series)
    }

    async fn get_metric_statistics(
        &self,
        query: &MetricQuery,
    ) -> Result<Vec<DataPoint>, MetricsApiError> {
        let response = self
            .client
            .get_metric_statistics()
            .namespace(ELB_NAMESPACE)
            .metric_name(&query.metric_name)
            .dimensions(
                AwsDimension::builder()
                    .name(&query.dimension.name)
                    .value(&query.dimension.value)
                    .build(),
            )
            .start_time(AwsDateTime::from_secs(query.start.timestamp()))
            .end_time(AwsDateTime::from_secs(query.end.timestamp()))
            .period(query.period_secs)
            .statistics(query.stat.to_statistic())
            .send()
            .await
            .map_err(|e| MetricsApiError::from_sdk("GetMetricStatistics", e))?;

        // Points without a usable timestamp cannot take part in "latest" selection.
        Ok(response
            .datapoints()
            .iter()
            .filter_map(|dp| {
                let ts = dp.timestamp()?;
                Some(DataPoint {
                    timestamp: DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())?,
                    average: dp.average(),
                    sum: dp.sum(),
                })
            })
            .collect())
    }
}

// ============================================================================
// SECTION 8: METRIC CLIENT
// ============================================================================

/// Value of the most recent point for `stat`, or `None` when there are no
/// points. Ties on timestamp go to the later point in the response.
pub fn latest_value(points: &[DataPoint], stat: StatKind) -> Option<f64> {
    points
        .iter()
        .max_by_key(|p| p.timestamp)
        .and_then(|p| p.value(stat))
}

/// Resolves one (dimension, metric, statistic) tuple to its latest value.
#[derive(Clone)]
pub struct MetricClient {
    api: Arc<dyn MetricsApi>,
}

impl MetricClient {
    pub fn new(api: Arc<dyn MetricsApi>) -> Self {
        Self { api }
    }

    /// `Ok(None)` means CloudWatch had no data in the window.
    pub async fn fetch_latest(
        &self,
        dimension: &Dimension,
        metric_name: &str,
        stat: StatKind,
    ) -> Result<Option<f64>, MetricsApiError> {
        self.fetch_latest_at(dimension, metric_name, stat, Utc::now())
            .await
    }

    pub async fn fetch_latest_at(
        &self,
        dimension: &Dimension,
        metric_name: &str,
        stat: StatKind,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>, MetricsApiError> {
        let query = MetricQuery::latest(dimension.clone(), metric_name, stat, now);
        let points = self.api.get_metric_statistics(&query).await?;
        let value = latest_value(&points, stat);

        trace!(
            target: "elb_plugin::fetch",
            dimension = %dimension,
            metric = metric_name,
            stat = %stat,
            points = points.len(),
            value = ?value,
            "Resolved latest point"
        );

        Ok(value)
    }
}

impl Debug for MetricClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricClient").finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION 9: TOPOLOGY DISCOVERY
// ============================================================================

/// Zone of a catalog series that is dimensioned by the zone alone.
///
/// Series with no dimensions or with extra dimensions are aggregates or
/// per-load-balancer breakdowns and are excluded.
pub fn zone_of(series: &MetricSeries) -> Option<&str> {
    match series.dimensions.as_slice() {
        [only] if only.name == ZONE_DIMENSION => Some(only.value.as_str()),
        _ => None,
    }
}

/// Enumerate the availability zones reporting host counts.
#[instrument(level = "debug", target = "elb_plugin::discovery", skip_all)]
pub async fn discover_zones(api: &dyn MetricsApi) -> Result<Topology, MetricsApiError> {
    let catalog = api
        .list_metrics(ELB_NAMESPACE, HEALTHY_HOST_COUNT, ZONE_DIMENSION)
        .await?;

    let topology: Topology = catalog
        .iter()
        .filter_map(zone_of)
        .map(str::to_string)
        .collect();

    info!(
        target: "elb_plugin::discovery",
        series = catalog.len(),
        zones = topology.len(),
        "Availability zones discovered"
    );

    Ok(topology)
}

// ============================================================================
// SECTION 10: SNAPSHOT ASSEMBLER
// ============================================================================

/// One statistics request and the snapshot key its value lands under.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPlan {
    pub key: String,
    pub dimension: Dimension,
    pub metric_name: &'static str,
    pub stat: StatKind,
}

/// Every request one polling cycle makes for `topology`.
pub fn plan_fetches(topology: &Topology) -> Vec<FetchPlan> {
    let mut plans = Vec::with_capacity(topology.len() * HOST_COUNT_METRICS.len() + 5);

    for zone in topology.iter() {
        for metric_name in HOST_COUNT_METRICS {
            plans.push(FetchPlan {
                key: zone_metric_key(metric_name, zone),
                dimension: Dimension::zone(zone),
                metric_name,
                stat: StatKind::Average,
            });
        }
    }

    plans.push(FetchPlan {
        key: LATENCY.to_string(),
        dimension: Dimension::service(),
        metric_name: LATENCY,
        stat: StatKind::Average,
    });

    for (metric_name, _) in HTTP_BACKEND_METRICS {
        plans.push(FetchPlan {
            key: metric_name.to_string(),
            dimension: Dimension::service(),
            metric_name,
            stat: StatKind::Sum,
        });
    }

    plans
}

/// Builds the key→value map for one polling cycle.
#[derive(Debug, Clone)]
pub struct SnapshotAssembler {
    client: MetricClient,
    concurrency: usize,
}

impl SnapshotAssembler {
    pub fn new(client: MetricClient, concurrency: usize) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
        }
    }

    /// Fetch every planned series. Failures and empty series are logged and
    /// leave their key out; they never fail the cycle.
    pub async fn build_snapshot(&self, topology: &Topology) -> Snapshot {
        let plans = plan_fetches(topology);
        let planned = plans.len();
        let limiter = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set = JoinSet::new();

        for plan in plans {
            let client = self.client.clone();
            let limiter = Arc::clone(&limiter);
            join_set.spawn(async move {
                // The semaphore is never closed, so the permit is always granted.
                let _permit = limiter.acquire_owned().await.ok();
                let result = client
                    .fetch_latest(&plan.dimension, plan.metric_name, plan.stat)
                    .await;
                (plan, result)
            });
        }

        let mut snapshot = Snapshot::new();
        let mut missing = 0usize;
        let mut failed = 0usize;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((plan, Ok(Some(value)))) => snapshot.insert(plan.key, value),
                Ok((plan, Ok(None))) => {
                    missing += 1;
                    debug!(
                        target: "elb_plugin::snapshot",
                        key = %plan.key,
                        dimension = %plan.dimension,
                        "No data points in window, skipping"
                    );
                }
                Ok((plan, Err(e))) => {
                    failed += 1;
                    warn!(
                        target: "elb_plugin::snapshot",
                        key = %plan.key,
                        dimension = %plan.dimension,
                        error = %e,
                        "Fetch failed, skipping"
                    );
                }
                Err(e) => {
                    failed += 1;
                    warn!(target: "elb_plugin::snapshot", error = %e, "Fetch task aborted");
                }
            }
        }

        info!(
            target: "elb_plugin::snapshot",
            planned,
            resolved = snapshot.len(),
            missing,
            failed,
            "Snapshot assembled"
        );

        snapshot
    }
}

// ============================================================================
// SECTION 11: SCHEMA BUILDER
// ============================================================================

/// Graphs whose members are generated per zone.
struct HostCountGraph {
    id: &'static str,
    metric_name: &'static str,
    label: &'static str,
}

const HOST_COUNT_GRAPHS: [HostCountGraph; 2] = [
    HostCountGraph {
        id: GRAPH_HEALTHY_HOST_COUNT,
        metric_name: HEALTHY_HOST_COUNT,
        label: "ELB Healthy Host Count",
    },
    HostCountGraph {
        id: GRAPH_UNHEALTHY_HOST_COUNT,
        metric_name: UNHEALTHY_HOST_COUNT,
        label: "ELB Unhealthy Host Count",
    },
];

/// The graphs that do not depend on topology.
pub fn base_schema() -> GraphSchema {
    GraphSchema::new().with_graphs([
        (
            GRAPH_LATENCY.to_string(),
            Graph {
                label: "Whole ELB Latency".into(),
                unit: GraphUnit::Float,
                metrics: vec![GraphMetric::new(LATENCY, LATENCY)],
            },
        ),
        (
            GRAPH_HTTP_BACKEND.to_string(),
            Graph {
                label: "Whole ELB HTTP Backend Count".into(),
                unit: GraphUnit::Integer,
                metrics: HTTP_BACKEND_METRICS
                    .iter()
                    .map(|(name, label)| GraphMetric::new(*name, *label).stacked())
                    .collect(),
            },
        ),
    ])
}

/// Healthy/unhealthy host count graphs with one stacked member per zone.
pub fn host_count_graphs(topology: &Topology) -> Vec<(String, Graph)> {
    HOST_COUNT_GRAPHS
        .iter()
        .map(|graph| {
            let metrics = topology
                .iter()
                .map(|zone| {
                    GraphMetric::new(zone_metric_key(graph.metric_name, zone), zone).stacked()
                })
                .collect();
            (
                graph.id.to_string(),
                Graph {
                    label: graph.label.into(),
                    unit: GraphUnit::Integer,
                    metrics,
                },
            )
        })
        .collect()
}

/// Full graph definition for `topology`, built fresh on every call.
pub fn build_schema(topology: &Topology) -> GraphSchema {
    base_schema().with_graphs(host_count_graphs(topology))
}

// ============================================================================
// SECTION 12: AGENT OUTPUT & STATE
// ============================================================================
// mackerel-agent text protocol:
// - metadata mode: header line + {"graphs": {...}} JSON
// - values mode: "<graph>.<metric>\t<value>\t<epoch>" per line
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Output Mode
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Graph definitions for the agent's metadata request
    Definitions,
    /// Current metric values
    Values,
}

impl OutputMode {
    pub fn from_meta_flag(meta_requested: bool) -> Self {
        if meta_requested {
            OutputMode::Definitions
        } else {
            OutputMode::Values
        }
    }

    /// Reads [`PLUGIN_META_ENV`].
    pub fn from_env() -> Self {
        Self::from_meta_flag(env::var_os(PLUGIN_META_ENV).is_some_and(|v| !v.is_empty()))
    }
}

// ----------------------------------------------------------------------------
// 12.2 Persisted State
// ----------------------------------------------------------------------------

/// Previous run's values, stored as a flat JSON object plus `_lastTime`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginState {
    #[serde(rename = "_lastTime", default, skip_serializing_if = "Option::is_none")]
    pub last_time: Option<i64>,

    #[serde(flatten)]
    pub values: HashMap<String, f64>,
}

impl PluginState {
    pub fn capture(snapshot: &Snapshot, now: DateTime<Utc>) -> Self {
        Self {
            last_time: Some(now.timestamp()),
            values: snapshot.as_map().clone(),
        }
    }
}

/// State file handle.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Previous state; a missing or unreadable file yields an empty state.
    pub fn load(&self) -> PluginState {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(
                    target: "elb_plugin::output",
                    path = %self.path.display(),
                    error = %e,
                    "No previous state (ignored)"
                );
                return PluginState::default();
            }
        };

        serde_json::from_slice(&raw).unwrap_or_else(|e| {
            warn!(
                target: "elb_plugin::output",
                path = %self.path.display(),
                error = %e,
                "Corrupt state file (ignored)"
            );
            PluginState::default()
        })
    }

    pub fn save(&self, state: &PluginState) -> Result<(), OutputError> {
        let encoded = serde_json::to_vec(state).map_err(|source| OutputError::Encode {
            what: "state",
            source,
        })?;
        fs::write(&self.path, encoded).map_err(|source| OutputError::StateWrite {
            path: self.path.clone(),
            source,
        })
    }
}

// ----------------------------------------------------------------------------
// 12.3 Rendering
// ----------------------------------------------------------------------------

#[derive(Serialize)]
struct GraphDefinitionPayload<'a> {
    graphs: &'a GraphSchema,
}

/// Write the metadata response.
pub fn write_definitions<W: Write>(schema: &GraphSchema, out: &mut W) -> Result<(), OutputError> {
    let payload = serde_json::to_string(&GraphDefinitionPayload { graphs: schema }).map_err(
        |source| OutputError::Encode {
            what: "graph definitions",
            source,
        },
    )?;
    writeln!(out, "{PLUGIN_META_HEADER}")?;
    writeln!(out, "{payload}")?;
    Ok(())
}

/// Integral values print without decimals, others with six.
pub fn format_value(value: f64) -> String {
    // -0.0 prints as "0".
    let value = if value == 0.0 { 0.0 } else { value };
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        format!("{value:.6}")
    }
}

/// Per-minute rate of change since the previous run.
pub fn calc_diff(
    current: f64,
    now_secs: i64,
    last: f64,
    last_secs: i64,
) -> Result<f64, DiffError> {
    let elapsed_secs = now_secs - last_secs;
    if elapsed_secs > MAX_DIFF_ELAPSED_SECS {
        return Err(DiffError::TooLongDuration { elapsed_secs });
    }
    if elapsed_secs <= 0 {
        return Err(DiffError::NoElapsedTime);
    }
    if current < last {
        return Err(DiffError::CounterReset { last, current });
    }
    Ok((current - last) * 60.0 / elapsed_secs as f64)
}

/// Write one line per graph member present in `snapshot`; returns the count.
pub fn write_values<W: Write>(
    schema: &GraphSchema,
    snapshot: &Snapshot,
    previous: &PluginState,
    now: DateTime<Utc>,
    out: &mut W,
) -> Result<usize, OutputError> {
    let now_secs = now.timestamp();
    let mut written = 0;

    for (graph_id, graph) in schema.iter() {
        for metric in &graph.metrics {
            let Some(mut value) = snapshot.get(&metric.name) else {
                continue;
            };

            if metric.diff {
                let diff = match (previous.values.get(&metric.name), previous.last_time) {
                    (Some(&last), Some(last_secs)) => calc_diff(value, now_secs, last, last_secs),
                    _ => Err(DiffError::NoPreviousValue),
                };
                match diff {
                    Ok(rate) => value = rate,
                    Err(e) => {
                        debug!(
                            target: "elb_plugin::output",
                            metric = %metric.name,
                            reason = %e,
                            "Diff skipped"
                        );
                        continue;
                    }
                }
            }

            writeln!(
                out,
                "{graph_id}.{}\t{}\t{now_secs}",
                metric.name,
                format_value(value)
            )?;
            written += 1;
        }
    }

    Ok(written)
}

// ============================================================================
// SECTION 13: PLUGIN
// ============================================================================

/// One run of the plugin against a prepared topology.
#[derive(Debug)]
pub struct ElbPlugin {
    topology: Arc<Topology>,
    assembler: SnapshotAssembler,
}

impl ElbPlugin {
    /// Discover zones; a failure here is fatal to the run.
    pub async fn prepare(api: Arc<dyn MetricsApi>, fetch: &FetchConfig) -> PluginResult<Self> {
        let topology = discover_zones(api.as_ref())
            .await
            .map_err(PluginError::Discovery)?;

        if topology.is_empty() {
            warn!(
                target: "elb_plugin::discovery",
                "No availability zones found; host count graphs will be empty"
            );
        }

        Ok(Self {
            topology: Arc::new(topology),
            assembler: SnapshotAssembler::new(MetricClient::new(api), fetch.concurrency),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub async fn fetch_metrics(&self) -> Snapshot {
        self.assembler.build_snapshot(&self.topology).await
    }

    pub fn graph_definition(&self) -> GraphSchema {
        build_schema(&self.topology)
    }

    /// Produce the output requested by `mode`.
    pub async fn run<W: Write>(
        &self,
        mode: OutputMode,
        state_file: &StateFile,
        out: &mut W,
    ) -> PluginResult<()> {
        match mode {
            OutputMode::Definitions => {
                write_definitions(&self.graph_definition(), out)?;
            }
            OutputMode::Values => {
                let previous = state_file.load();
                let snapshot = self.fetch_metrics().await;
                let now = Utc::now();

                state_file.save(&PluginState::capture(&snapshot, now))?;

                let written =
                    write_values(&self.graph_definition(), &snapshot, &previous, now, out)?;
                debug!(target: "elb_plugin::output", lines = written, "Values written");
            }
        }
        out.flush().map_err(OutputError::from)?;
        Ok(())
    }
}

// ============================================================================
// SECTION 14: CLI & COMMAND LINE INTERFACE
// ============================================================================

/// ELB metrics plugin CLI
#[derive(Parser, Debug)]
#[command(
    name = "mackerel-plugin-aws-elb",
    version,
    about = "Report AWS ELB CloudWatch metrics to mackerel-agent"
)]
pub struct Cli {
    /// AWS Region (resolved from the environment when omitted)
    #[arg(long)]
    pub region: Option<String>,

    /// AWS Access Key ID
    #[arg(long = "access-key-id")]
    pub access_key_id: Option<String>,

    /// AWS Secret Access Key
    #[arg(long = "secret-access-key")]
    pub secret_access_key: Option<String>,

    /// Temp file name
    #[arg(long)]
    pub tempfile: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, env = "ELB_PLUGIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// CloudWatch endpoint override
    #[arg(long = "endpoint-url")]
    pub endpoint_url: Option<String>,

    /// Statistics requests in flight at once
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Log level override
    #[arg(short, long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Every configuration layer merged, flags last, then validated once.
    pub fn load_config(&self) -> Result<PluginConfig, ConfigError> {
        let mut config = PluginConfig::load(self.config.as_deref())?;
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Flags win over file and environment values.
    pub fn apply_overrides(&self, config: &mut PluginConfig) {
        if let Some(region) = &self.region {
            config.aws.region = region.clone();
        }
        if let Some(key) = &self.access_key_id {
            config.aws.access_key_id = Some(key.clone());
        }
        if let Some(secret) = &self.secret_access_key {
            config.aws.secret_access_key = Some(secret.clone());
        }
        if let Some(url) = &self.endpoint_url {
            config.aws.endpoint_url = Some(url.clone());
        }
        if let Some(tempfile) = &self.tempfile {
            config.output.tempfile = tempfile.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.fetch.concurrency = concurrency;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

/// Use the configured region, or fall back to the SDK region chain
/// (environment, profile, instance metadata).
pub async fn resolve_region(configured: &str) -> Option<String> {
    if !configured.trim().is_empty() {
        return Some(configured.trim().to_string());
    }
    RegionProviderChain::default_provider()
        .region()
        .await
        .map(|region| region.as_ref().to_string())
}

// ============================================================================
// SECTION 15: MAIN ENTRY POINT
// ============================================================================

async fn run(cli: Cli) -> AnyhowResult<()> {
    let mut config = cli.load_config().context("failed to load configuration")?;

    init_logging(&config.logging)?;

    config.aws.region = resolve_region(&config.aws.region)
        .await
        .ok_or_else(|| ConfigError::missing_field("aws.region"))
        .context("could not determine AWS region")?;

    let api = CloudWatchApi::connect(&config.aws)
        .await
        .context("failed to configure CloudWatch client")?;

    let plugin = ElbPlugin::prepare(Arc::new(api), &config.fetch).await?;
    let state_file = StateFile::new(&config.output.tempfile);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    plugin.run(OutputMode::from_env(), &state_file, &mut out).await?;
    Ok(())
}

/// Main entry point for the plugin
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(target: "elb_plugin::main", error = %format!("{e:#}"), "Run failed");
        return Err(e);
    }

    Ok(())
}

// ============================================================================
// SECTION 16: TESTS - CORE TYPES, CONFIGURATION & OUTPUT
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[rstest]
    #[case(StatKind::Average, "Average")]
    #[case(StatKind::Sum, "Sum")]
    fn test_stat_kind_wire_names(#[case] kind: StatKind, #[case] wire: &str) {
        assert_eq!(kind.as_wire_str(), wire);
        assert_eq!(kind.to_string(), wire);
    }

    #[test]
    fn test_query_window_is_two_periods() {
        let now = at(1_700_000_000);
        let query = MetricQuery::latest(Dimension::service(), LATENCY, StatKind::Average, now);

        assert_eq!(query.end, now);
        assert_eq!(query.start, at(1_700_000_000 - 120));
        assert_eq!(query.period_secs, 60);
    }

    #[test]
    fn test_dimension_display() {
        assert_eq!(Dimension::zone("us-east-1a").to_string(), "AvailabilityZone=us-east-1a");
        assert_eq!(Dimension::service().to_string(), "Service=ELB");
    }

    #[test]
    fn test_zone_metric_key() {
        assert_eq!(
            zone_metric_key(HEALTHY_HOST_COUNT, "us-east-1a"),
            "HealthyHostCount_us-east-1a"
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = PluginConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.fetch.concurrency, DEFAULT_FETCH_CONCURRENCY);
        assert_eq!(config.output.tempfile, PathBuf::from(DEFAULT_TEMPFILE));
        assert_eq!(config.aws.operation_timeout, Duration::from_secs(10));
        assert!(config.aws.region.is_empty());
        assert!(config.aws.static_credentials().is_none());
    }

    #[test]
    fn test_config_from_toml() {
        let config = PluginConfig::from_toml_str(
            r#"
            [aws]
            region = "ap-northeast-1"
            access_key_id = "AKIDEXAMPLE"
            secret_access_key = "secret"
            operation_timeout = "3s"

            [fetch]
            concurrency = 8

            [output]
            tempfile = "/var/tmp/elb-state"
            "#,
        )
        .unwrap();

        assert_eq!(config.aws.region, "ap-northeast-1");
        assert_eq!(
            config.aws.static_credentials(),
            Some(("AKIDEXAMPLE", "secret"))
        );
        assert_eq!(config.aws.operation_timeout, Duration::from_secs(3));
        assert_eq!(config.fetch.concurrency, 8);
        assert_eq!(config.output.tempfile, PathBuf::from("/var/tmp/elb-state"));
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[rstest]
    #[case("[fetch]\nconcurrency = 0", "fetch.concurrency")]
    #[case("[fetch]\nconcurrency = 33", "fetch.concurrency")]
    #[case("[aws]\naccess_key_id = \"AKID\"", "aws.access_key_id")]
    #[case("[aws]\noperation_timeout = \"0s\"", "aws.operation_timeout")]
    #[case("[logging]\nformat = \"xml\"", "logging.format")]
    #[case("[logging]\nlevel = \"verbos\"", "logging.level")]
    fn test_config_validation_rejects(#[case] toml_str: &str, #[case] field: &str) {
        match PluginConfig::from_toml_str(toml_str) {
            Err(ConfigError::InvalidValue { field: got, .. }) => assert_eq!(got, field),
            other => panic!("expected invalid value for {field}, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_credentials_count_as_absent() {
        let config = PluginConfig::from_toml_str(
            "[aws]\naccess_key_id = \"\"\nsecret_access_key = \"\"",
        )
        .unwrap();
        assert!(config.aws.static_credentials().is_none());
    }

    #[test]
    fn test_config_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "plugin.toml",
                r#"
                [aws]
                region = "eu-west-1"

                [fetch]
                concurrency = 2
                "#,
            )?;
            jail.set_env("ELB_PLUGIN_FETCH__CONCURRENCY", "6");

            let config = PluginConfig::load(Some(Path::new("plugin.toml")))
                .map_err(|e| e.to_string())?;

            assert_eq!(config.aws.region, "eu-west-1");
            assert_eq!(config.fetch.concurrency, 6);
            assert_eq!(config.output.tempfile, PathBuf::from(DEFAULT_TEMPFILE));
            Ok(())
        });
    }

    #[test]
    fn test_cli_flags_override_invalid_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("ELB_PLUGIN_FETCH__CONCURRENCY", "0");

            let cli = Cli::parse_from(["mackerel-plugin-aws-elb", "--concurrency", "4"]);
            let config = cli.load_config().map_err(|e| e.to_string())?;

            assert_eq!(config.fetch.concurrency, 4);
            Ok(())
        });
    }

    #[test]
    fn test_credentials_split_between_env_and_cli() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("ELB_PLUGIN_AWS__ACCESS_KEY_ID", "AKID");

            let cli = Cli::parse_from(["mackerel-plugin-aws-elb", "--secret-access-key", "s3cret"]);
            let config = cli.load_config().map_err(|e| e.to_string())?;
            assert_eq!(config.aws.static_credentials(), Some(("AKID", "s3cret")));

            let cli = Cli::parse_from(["mackerel-plugin-aws-elb"]);
            match cli.load_config() {
                Err(ConfigError::InvalidValue { field, .. }) => {
                    assert_eq!(field, "aws.access_key_id")
                }
                other => panic!("expected partial credentials to be rejected, got {other:?}"),
            }
            Ok(())
        });
    }

    #[test]
    fn test_config_missing_file() {
        let err = PluginConfig::load(Some(Path::new("/nonexistent/elb-plugin.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "mackerel-plugin-aws-elb",
            "--region",
            "us-west-2",
            "--tempfile",
            "/tmp/elb-test",
            "--concurrency",
            "1",
        ]);
        let mut config = PluginConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.aws.region, "us-west-2");
        assert_eq!(config.output.tempfile, PathBuf::from("/tmp/elb-test"));
        assert_eq!(config.fetch.concurrency, 1);
        assert!(config.aws.access_key_id.is_none());
    }

    #[test]
    fn test_aws_config_debug_redacts_secret() {
        let config = AwsConfig {
            secret_access_key: Some("very-secret".into()),
            ..AwsConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_resolve_region_prefers_configured() {
        assert_eq!(
            resolve_region(" us-east-1 ").await.as_deref(),
            Some("us-east-1")
        );
    }

    #[tokio::test]
    async fn test_connect_requires_region() {
        let err = CloudWatchApi::connect(&AwsConfig::default()).await.unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { ref field } if field == "aws.region"));
    }

    #[test]
    fn test_output_mode_from_flag() {
        assert_eq!(OutputMode::from_meta_flag(true), OutputMode::Definitions);
        assert_eq!(OutputMode::from_meta_flag(false), OutputMode::Values);
    }

    #[test]
    fn test_plugin_error_categories() {
        let err = PluginError::Discovery(MetricsApiError::request("ListMetrics", "denied"));
        assert!(err.is_fatal());
        assert_eq!(err.category(), "discovery");
        assert_eq!(
            err.to_string(),
            "Availability zone discovery failed: ListMetrics request failed: denied"
        );

        let err: PluginError = ConfigError::missing_field("aws.region").into();
        assert_eq!(err.category(), "config");
    }

    #[rstest]
    #[case(3.0, "3")]
    #[case(0.0, "0")]
    #[case(-0.0, "0")]
    #[case(12.5, "12.500000")]
    #[case(0.000123, "0.000123")]
    fn test_format_value(#[case] value: f64, #[case] expected: &str) {
        assert_eq!(format_value(value), expected);
    }

    #[test]
    fn test_calc_diff() {
        assert_eq!(calc_diff(160.0, 1060, 100.0, 1000), Ok(60.0));
        assert_eq!(calc_diff(130.0, 1120, 100.0, 1000), Ok(15.0));
        assert_eq!(
            calc_diff(160.0, 2000, 100.0, 1000),
            Err(DiffError::TooLongDuration { elapsed_secs: 1000 })
        );
        assert_eq!(calc_diff(160.0, 1000, 100.0, 1000), Err(DiffError::NoElapsedTime));
        assert_eq!(
            calc_diff(50.0, 1060, 100.0, 1000),
            Err(DiffError::CounterReset { last: 100.0, current: 50.0 })
        );
    }

    #[test]
    fn test_write_definitions() {
        let topology = Topology::new(vec!["us-east-1a".into(), "us-east-1b".into()]);
        let mut out = Vec::new();
        write_definitions(&build_schema(&topology), &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(PLUGIN_META_HEADER));

        let payload: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        let healthy = &payload["graphs"][GRAPH_HEALTHY_HOST_COUNT];
        assert_eq!(healthy["label"], "ELB Healthy Host Count");
        assert_eq!(healthy["unit"], "integer");
        assert_eq!(healthy["metrics"][0]["name"], "HealthyHostCount_us-east-1a");
        assert_eq!(healthy["metrics"][0]["label"], "us-east-1a");
        assert_eq!(healthy["metrics"][0]["stacked"], true);
        assert_eq!(payload["graphs"][GRAPH_LATENCY]["unit"], "float");
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_write_values() {
        let topology = Topology::new(vec!["us-east-1a".into(), "us-east-1b".into()]);
        let snapshot: Snapshot = [
            ("Latency".to_string(), 12.5),
            ("HTTPCode_Backend_4XX".to_string(), 0.0),
            ("HealthyHostCount_us-east-1a".to_string(), 3.0),
        ]
        .into_iter()
        .collect();

        let mut out = Vec::new();
        let written = write_values(
            &build_schema(&topology),
            &snapshot,
            &PluginState::default(),
            at(1_700_000_000),
            &mut out,
        )
        .unwrap();

        assert_eq!(written, 3);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "elb.healthy_host_count.HealthyHostCount_us-east-1a\t3\t1700000000\n\
             elb.http_backend.HTTPCode_Backend_4XX\t0\t1700000000\n\
             elb.latency.Latency\t12.500000\t1700000000\n"
        );
    }

    #[test]
    fn test_write_values_diff_uses_previous_state() {
        let schema = GraphSchema::new().with_graphs([(
            "custom.requests".to_string(),
            Graph {
                label: "Requests".into(),
                unit: GraphUnit::Float,
                metrics: vec![GraphMetric::new("Requests", "Requests").diff()],
            },
        )]);
        let snapshot: Snapshot = [("Requests".to_string(), 160.0)].into_iter().collect();

        let mut out = Vec::new();
        let written =
            write_values(&schema, &snapshot, &PluginState::default(), at(1060), &mut out).unwrap();
        assert_eq!(written, 0);

        let previous = PluginState {
            last_time: Some(1000),
            values: [("Requests".to_string(), 100.0)].into_iter().collect(),
        };
        let written = write_values(&schema, &snapshot, &previous, at(1060), &mut out).unwrap();
        assert_eq!(written, 1);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "custom.requests.Requests\t60\t1060\n"
        );
    }

    #[test]
    fn test_state_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = StateFile::new(dir.path().join("mackerel-plugin-elb"));

        assert_eq!(state_file.load(), PluginState::default());

        let snapshot: Snapshot = [("Latency".to_string(), 0.25)].into_iter().collect();
        let state = PluginState::capture(&snapshot, at(1_700_000_000));
        state_file.save(&state).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(state_file.path()).unwrap()).unwrap();
        assert_eq!(raw[STATE_LAST_TIME_KEY], 1_700_000_000);
        assert_eq!(raw["Latency"], 0.25);

        assert_eq!(state_file.load(), state);
    }

    #[test]
    fn test_corrupt_state_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        fs::write(&path, b"not json").unwrap();

        assert_eq!(StateFile::new(&path).load(), PluginState::default());
    }

    #[test]
    fn test_state_write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = StateFile::new(dir.path().join("missing-dir").join("state"));

        let err = state_file.save(&PluginState::default()).unwrap_err();
        assert!(matches!(err, OutputError::StateWrite { .. }));
    }
}

// ============================================================================
// SECTION 17: TESTS - DISCOVERY, FETCHING, SNAPSHOT & SCHEMA
// ============================================================================
