pub mod client;

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::VCenterConfig;

/// Opaque handle identifying an inventory object, compared by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManagedObjectRef {
    /// Managed object type, e.g. "VirtualMachine".
    #[serde(rename = "type")]
    pub kind: String,
    /// Server-assigned identifier, e.g. "vm-42".
    pub value: String,
}

impl ManagedObjectRef {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// Well-known managed objects advertised by the service instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceContent {
    pub root_folder: ManagedObjectRef,
    pub property_collector: ManagedObjectRef,
    pub view_manager: ManagedObjectRef,
    pub perf_manager: ManagedObjectRef,
    pub session_manager: ManagedObjectRef,
}

/// Key of a performance counter description (group or counter name).
#[derive(Debug, Clone, Deserialize)]
pub struct ElementDescription {
    pub key: String,
}

/// One entry of the performance manager's counter catalog.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfCounterInfo {
    /// Counter id used in performance queries.
    pub key: i32,
    pub name_info: ElementDescription,
    pub group_info: ElementDescription,
    /// Rollup type, e.g. "average" or "latest".
    pub rollup_type: String,
}

impl PerfCounterInfo {
    /// Composite `group.counter.rollup` identifier matched against declared metrics.
    pub fn identifier(&self) -> String {
        format!(
            "{}.{}.{}",
            self.group_info.key, self.name_info.key, self.rollup_type
        )
    }
}

/// Counter and instance selector of one requested metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfMetricId {
    pub counter_id: i32,
    pub instance: String,
}

/// A windowed performance query for a single entity.
#[derive(Debug, Clone)]
pub struct PerfQuerySpec {
    pub entity: ManagedObjectRef,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub metric_ids: Vec<PerfMetricId>,
    pub interval_id: i32,
}

/// Raw per-interval samples for one (entity, counter, instance).
/// Negative samples mean "no data".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSeries {
    pub entity: ManagedObjectRef,
    pub counter_id: i32,
    pub instance: String,
    pub samples: Vec<i64>,
}

/// Query result for one entity, correlated by the embedded entity reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMetric {
    pub entity: ManagedObjectRef,
    pub series: Vec<RawSeries>,
}

/// Properties retrieved for one managed object, keyed by property path.
#[derive(Debug, Clone)]
pub struct ObjectContent {
    pub obj: ManagedObjectRef,
    pub props: HashMap<String, Value>,
}

impl ObjectContent {
    pub fn new(obj: ManagedObjectRef) -> Self {
        Self {
            obj,
            props: HashMap::new(),
        }
    }

    /// Decode a property value. Returns `Ok(None)` when the property is unset.
    pub fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.props.get(path) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .with_context(|| format!("decoding property {path} of {}", self.obj)),
        }
    }
}

/// Classified protocol errors.
#[derive(Error, Debug)]
pub enum VsphereError {
    #[error("unexpected data object type {found:?} (expected {expected})")]
    UnexpectedType {
        expected: &'static str,
        found: String,
    },

    #[error("data object is missing its _typeName discriminant")]
    MissingType,

    #[error("CSV performance results are not supported")]
    CsvNotSupported,

    #[error("{method} failed with status {status}: {body}")]
    Status {
        method: String,
        status: u16,
        body: String,
    },

    #[error("login response did not carry a session id")]
    NoSessionId,
}

/// Discriminant of the polymorphic performance result objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfObjectType {
    EntityMetric,
    EntityMetricCsv,
    IntSeries,
    SeriesCsv,
}

impl PerfObjectType {
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "PerfEntityMetric" => Some(Self::EntityMetric),
            "PerfEntityMetricCSV" => Some(Self::EntityMetricCsv),
            "PerfMetricIntSeries" => Some(Self::IntSeries),
            "PerfMetricSeriesCSV" => Some(Self::SeriesCsv),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EntityMetric => "PerfEntityMetric",
            Self::EntityMetricCsv => "PerfEntityMetricCSV",
            Self::IntSeries => "PerfMetricIntSeries",
            Self::SeriesCsv => "PerfMetricSeriesCSV",
        }
    }
}

#[derive(Deserialize)]
struct EntityMetricJson {
    entity: ManagedObjectRef,
    #[serde(default)]
    value: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricIdJson {
    counter_id: i32,
    #[serde(default)]
    instance: String,
}

#[derive(Deserialize)]
struct IntSeriesJson {
    id: MetricIdJson,
    #[serde(default)]
    value: Vec<i64>,
}

fn perf_object_type(value: &Value) -> Result<PerfObjectType, VsphereError> {
    let name = value
        .get("_typeName")
        .and_then(Value::as_str)
        .ok_or(VsphereError::MissingType)?;

    PerfObjectType::from_type_name(name).ok_or_else(|| VsphereError::UnexpectedType {
        expected: "PerfEntityMetricBase",
        found: name.to_string(),
    })
}

/// Decode one `PerfEntityMetricBase` result into an [`EntityMetric`].
pub fn decode_entity_metric(value: Value) -> Result<EntityMetric> {
    match perf_object_type(&value)? {
        PerfObjectType::EntityMetric => {}
        PerfObjectType::EntityMetricCsv => return Err(VsphereError::CsvNotSupported.into()),
        other => {
            return Err(VsphereError::UnexpectedType {
                expected: PerfObjectType::EntityMetric.as_str(),
                found: other.as_str().to_string(),
            }
            .into())
        }
    }

    let raw: EntityMetricJson =
        serde_json::from_value(value).context("decoding PerfEntityMetric")?;

    let mut series = Vec::with_capacity(raw.value.len());
    for item in raw.value {
        match perf_object_type(&item)? {
            PerfObjectType::IntSeries => {}
            PerfObjectType::SeriesCsv => return Err(VsphereError::CsvNotSupported.into()),
            other => {
                return Err(VsphereError::UnexpectedType {
                    expected: PerfObjectType::IntSeries.as_str(),
                    found: other.as_str().to_string(),
                }
                .into())
            }
        }

        let s: IntSeriesJson =
            serde_json::from_value(item).context("decoding PerfMetricIntSeries")?;
        series.push(RawSeries {
            entity: raw.entity.clone(),
            counter_id: s.id.counter_id,
            instance: s.id.instance,
            samples: s.value,
        });
    }

    Ok(EntityMetric {
        entity: raw.entity,
        series,
    })
}

/// An authenticated session against one vCenter.
///
/// [`client::HttpSession`] speaks the Web Services JSON protocol; tests use
/// in-memory fakes.
pub trait Session: Send + Sync {
    /// Well-known managed objects of this vCenter.
    fn service_content(&self) -> &ServiceContent;

    /// Retrieve the given property paths of a single object.
    fn retrieve_one(
        &self,
        obj: &ManagedObjectRef,
        paths: &[&str],
    ) -> impl std::future::Future<Output = Result<ObjectContent>> + Send;

    /// Retrieve the given property paths of many objects in one call.
    fn retrieve_properties(
        &self,
        objs: &[ManagedObjectRef],
        paths: &[&str],
    ) -> impl std::future::Future<Output = Result<Vec<ObjectContent>>> + Send;

    /// Create a container view over `container` restricted to `types`.
    fn create_container_view(
        &self,
        container: &ManagedObjectRef,
        types: &[String],
        recursive: bool,
    ) -> impl std::future::Future<Output = Result<ManagedObjectRef>> + Send;

    /// Run a batch of performance queries.
    fn query_perf(
        &self,
        specs: &[PerfQuerySpec],
    ) -> impl std::future::Future<Output = Result<Vec<EntityMetric>>> + Send;

    /// Terminate the session.
    fn logout(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Establishes sessions against monitored vCenters.
pub trait Connector: Send + Sync {
    type Session: Session + 'static;

    fn connect(
        &self,
        source: &VCenterConfig,
    ) -> impl std::future::Future<Output = Result<Self::Session>> + Send;
}
