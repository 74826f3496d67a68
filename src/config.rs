use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};

use crate::sink::line_protocol::Precision;

/// Top-level configuration for the collector.
///
/// Field aliases accept the legacy JSON document layout (`VCenters`,
/// `Metrics`, `Interval`, `Domain`, `InfluxDB`), so an existing
/// `/etc/vsphere-influxdb.json` loads unchanged.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// vCenter endpoints to poll.
    #[serde(default, alias = "VCenters")]
    pub vcenters: Vec<VCenterConfig>,

    /// Metric subscriptions, resolved against each vCenter's counter catalog.
    #[serde(default, alias = "Metrics")]
    pub metrics: Vec<MetricSubscription>,

    /// Polling interval, also the width of the query window. Accepts integer
    /// seconds or a humantime string ("60s", "5m"). Default: 60s.
    #[serde(
        default = "default_interval",
        alias = "Interval",
        deserialize_with = "deserialize_interval"
    )]
    pub interval: Duration,

    /// Domain suffix stripped from vCenter and object names in tags.
    #[serde(default, alias = "Domain")]
    pub domain: String,

    /// InfluxDB sink configuration.
    #[serde(default, alias = "InfluxDB")]
    pub influxdb: InfluxDbConfig,

    /// Per-source scheduling policy.
    #[serde(default)]
    pub scheduling: SchedulingConfig,

    /// vSphere API client configuration.
    #[serde(default)]
    pub vsphere: VsphereConfig,

    /// Health metrics export configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// A monitored vCenter.
#[derive(Debug, Clone, Deserialize)]
pub struct VCenterConfig {
    /// Host name (optionally `host:port`) of the vCenter.
    #[serde(alias = "Hostname")]
    pub hostname: String,

    #[serde(default, alias = "Username")]
    pub username: String,

    #[serde(default, alias = "Password")]
    pub password: String,

    /// Skip TLS certificate verification. Default: true.
    #[serde(default = "default_true")]
    pub insecure: bool,
}

/// A group of metric definitions applicable to a set of object types.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricSubscription {
    /// vSphere managed object types (e.g. "VirtualMachine", "HostSystem").
    #[serde(alias = "ObjectType")]
    pub object_type: Vec<String>,

    #[serde(alias = "Definition")]
    pub definition: Vec<MetricDeclaration>,
}

/// A declared metric: `group.counter.rollup` plus an instance selector.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricDeclaration {
    #[serde(alias = "Metric")]
    pub metric: String,

    /// "" for the aggregate only, "*" for all instances, or an instance id.
    #[serde(default, alias = "Instances")]
    pub instances: String,
}

/// InfluxDB 1.x HTTP write configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InfluxDbConfig {
    /// Base URL of the InfluxDB HTTP API (e.g. "http://influx:8086").
    #[serde(default, alias = "Hostname")]
    pub hostname: String,

    #[serde(default, alias = "Username")]
    pub username: String,

    #[serde(default, alias = "Password")]
    pub password: String,

    #[serde(default, alias = "Database")]
    pub database: String,

    /// Timestamp precision of written points. Default: seconds.
    #[serde(default)]
    pub precision: Precision,

    /// Request body compression (none, gzip). Default: none.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Write request timeout. Default: 30s.
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// How sources are processed within one polling pass.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulingConfig {
    /// Processing mode. Default: sequential.
    #[serde(default)]
    pub mode: SchedulingMode,

    /// Maximum sources in flight in concurrent mode. Default: 4.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-source deadline in concurrent mode; zero disables it. Default: 0.
    #[serde(default, with = "humantime_serde")]
    pub source_timeout: Duration,
}

/// Source processing modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// One source at a time, no deadline.
    #[default]
    Sequential,
    /// Bounded fan-out across sources with an optional deadline each.
    Concurrent,
}

/// vSphere Web Services (JSON) client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VsphereConfig {
    /// API release segment of the `/sdk/vim25/{release}` path. Default: "8.0.1.0".
    #[serde(default = "default_api_release")]
    pub api_release: String,

    /// Request timeout. Default: 60s.
    #[serde(default = "default_vsphere_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Health metrics export configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct HealthConfig {
    /// Prometheus textfile written after each run; empty disables it.
    #[serde(default)]
    pub textfile_path: String,
}

// --- Default value functions ---

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_concurrent() -> usize {
    4
}

fn default_api_release() -> String {
    "8.0.1.0".to_string()
}

fn default_vsphere_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Accepts either integer seconds (legacy) or a humantime string.
fn deserialize_interval<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Interval {
        Seconds(u64),
        Human(#[serde(with = "humantime_serde")] Duration),
    }

    Ok(match Interval::deserialize(deserializer)? {
        Interval::Seconds(secs) => Duration::from_secs(secs),
        Interval::Human(d) => d,
    })
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            vcenters: Vec::new(),
            metrics: Vec::new(),
            interval: default_interval(),
            domain: String::new(),
            influxdb: InfluxDbConfig::default(),
            scheduling: SchedulingConfig::default(),
            vsphere: VsphereConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for VCenterConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            insecure: default_true(),
        }
    }
}

impl Default for InfluxDbConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            database: String::new(),
            precision: Precision::default(),
            compression: default_compression(),
            timeout: default_write_timeout(),
        }
    }
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            mode: SchedulingMode::default(),
            max_concurrent: default_max_concurrent(),
            source_timeout: Duration::ZERO,
        }
    }
}

impl Default for VsphereConfig {
    fn default() -> Self {
        Self {
            api_release: default_api_release(),
            timeout: default_vsphere_timeout(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML (or legacy JSON) file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg = Self::parse(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Parse a configuration document without validating it.
    pub fn parse(data: &str) -> Result<Self> {
        serde_yaml::from_str(data).context("decoding configuration")
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("interval must be positive");
        }

        for (i, vcenter) in self.vcenters.iter().enumerate() {
            if vcenter.hostname.is_empty() {
                bail!("vcenters[{i}].hostname is required");
            }
        }

        for (i, subscription) in self.metrics.iter().enumerate() {
            if subscription.object_type.is_empty() {
                bail!("metrics[{i}].object_type must list at least one type");
            }
            for declaration in &subscription.definition {
                if declaration.metric.is_empty() {
                    bail!("metrics[{i}].definition contains an empty metric name");
                }
            }
        }

        if !self.vcenters.is_empty() {
            if self.influxdb.hostname.is_empty() {
                bail!("influxdb.hostname is required");
            }
            if self.influxdb.database.is_empty() {
                bail!("influxdb.database is required");
            }
        }

        match self.influxdb.compression.as_str() {
            "none" | "gzip" => {}
            other => bail!("invalid influxdb compression: {other}"),
        }

        if self.scheduling.mode == SchedulingMode::Concurrent && self.scheduling.max_concurrent == 0
        {
            bail!("scheduling.max_concurrent must be positive in concurrent mode");
        }

        if self.vsphere.api_release.is_empty() {
            bail!("vsphere.api_release is required");
        }

        Ok(())
    }
}
