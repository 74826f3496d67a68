use crate::vsphere::{ManagedObjectRef, RawSeries};

/// Value reported when a series holds no usable samples.
///
/// Negative samples mark intervals without data and are excluded from every
/// reduction except `latest`, which reports the final sample verbatim.
pub const NO_DATA: i64 = -1;

/// Counter rollup, taken from the suffix of the metric name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollup {
    Average,
    Maximum,
    Minimum,
    Latest,
    Summation,
}

impl Rollup {
    /// Parses the rollup from a `group.counter.rollup` name.
    pub fn from_metric_name(name: &str) -> Option<Self> {
        let suffix = name.rsplit('.').next()?;
        match suffix.to_ascii_lowercase().as_str() {
            "average" => Some(Self::Average),
            "maximum" => Some(Self::Maximum),
            "minimum" => Some(Self::Minimum),
            "latest" => Some(Self::Latest),
            "summation" => Some(Self::Summation),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Average => "average",
            Self::Maximum => "maximum",
            Self::Minimum => "minimum",
            Self::Latest => "latest",
            Self::Summation => "summation",
        }
    }

    pub fn reduce(self, samples: &[i64]) -> i64 {
        match self {
            Self::Average => average(samples),
            Self::Maximum => maximum(samples),
            Self::Minimum => minimum(samples),
            Self::Latest => latest(samples),
            Self::Summation => summation(samples),
        }
    }
}

/// Mean of non-negative samples, rounded half up. [`NO_DATA`] if none.
pub fn average(samples: &[i64]) -> i64 {
    let (total, count) = samples
        .iter()
        .filter(|v| **v >= 0)
        .fold((0i128, 0i64), |(total, count), v| (total + i128::from(*v), count + 1));

    if count == 0 {
        return NO_DATA;
    }

    let mean = total as f64 / count as f64;
    (mean + 0.5).floor() as i64
}

/// Largest non-negative sample, [`NO_DATA`] if none.
pub fn maximum(samples: &[i64]) -> i64 {
    samples.iter().copied().filter(|v| *v >= 0).max().unwrap_or(NO_DATA)
}

/// Smallest non-negative sample, [`NO_DATA`] if none.
pub fn minimum(samples: &[i64]) -> i64 {
    samples.iter().copied().filter(|v| *v >= 0).min().unwrap_or(NO_DATA)
}

/// Last sample, unfiltered. [`NO_DATA`] for an empty series.
pub fn latest(samples: &[i64]) -> i64 {
    samples.last().copied().unwrap_or(NO_DATA)
}

/// Sum of strictly positive samples.
pub fn summation(samples: &[i64]) -> i64 {
    samples
        .iter()
        .copied()
        .filter(|v| *v > 0)
        .fold(0i64, i64::saturating_add)
}

/// One reduced series, shaped for point assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedValue {
    /// First segment of the metric name (the counter group).
    pub measurement: String,
    pub entity: ManagedObjectRef,
    /// Normalised instance; empty for entity-level values.
    pub instance: String,
    /// Metric name with dots replaced by underscores.
    pub field_name: String,
    pub value: i64,
}

impl AggregatedValue {
    pub fn is_entity_level(&self) -> bool {
        self.instance.is_empty()
    }
}

/// Reduce `series` according to the rollup encoded in `metric_name`.
///
/// Unrecognised rollups (e.g. `none`) report [`NO_DATA`].
pub fn aggregate(metric_name: &str, series: &RawSeries) -> AggregatedValue {
    let metric_name = metric_name.to_lowercase();
    let field_name = metric_name.replace('.', "_");
    let measurement = metric_name
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string();

    // Datastore counters are never split per instance.
    let instance = if field_name.contains("datastore") {
        String::new()
    } else {
        series.instance.replace('.', "_").to_lowercase()
    };

    let value = Rollup::from_metric_name(&metric_name)
        .map(|rollup| rollup.reduce(&series.samples))
        .unwrap_or(NO_DATA);

    AggregatedValue {
        measurement,
        entity: series.entity.clone(),
        instance,
        field_name,
        value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(instance: &str, samples: &[i64]) -> RawSeries {
        RawSeries {
            entity: ManagedObjectRef::new("VirtualMachine", "vm-1"),
            counter_id: 1,
            instance: instance.to_string(),
            samples: samples.to_vec(),
        }
    }

    #[test]
    fn test_average() {
        assert_eq!(average(&[10, 20, 30]), 20);
        assert_eq!(average(&[-1, 10]), 10);
        assert_eq!(average(&[1, 2]), 2);
        assert_eq!(average(&[1, 1, 2]), 1);
        assert_eq!(average(&[0, 0]), 0);
    }

    #[test]
    fn test_average_without_data() {
        assert_eq!(average(&[-1, -1]), NO_DATA);
        assert_eq!(average(&[]), NO_DATA);
    }

    #[test]
    fn test_maximum_minimum() {
        assert_eq!(maximum(&[-1, -1]), -1);
        assert_eq!(maximum(&[3, -1, 9, 0]), 9);
        assert_eq!(minimum(&[5, -1, 2]), 2);
        assert_eq!(minimum(&[-1]), -1);
        assert_eq!(minimum(&[0, 4]), 0);
    }

    #[test]
    fn test_latest() {
        assert_eq!(latest(&[1, 2, -1]), -1);
        assert_eq!(latest(&[1, 2, 3]), 3);
        assert_eq!(latest(&[]), NO_DATA);
    }

    #[test]
    fn test_summation() {
        assert_eq!(summation(&[-5, 0, 3, 4]), 7);
        assert_eq!(summation(&[-1, -1]), 0);
        assert_eq!(summation(&[]), 0);
    }

    #[test]
    fn test_rollup_from_metric_name() {
        assert_eq!(
            Rollup::from_metric_name("cpu.usage.average"),
            Some(Rollup::Average)
        );
        assert_eq!(
            Rollup::from_metric_name("net.received.SUMMATION"),
            Some(Rollup::Summation)
        );
        assert_eq!(
            Rollup::from_metric_name("sys.uptime.latest"),
            Some(Rollup::Latest)
        );
        assert_eq!(Rollup::from_metric_name("cpu.usage.none"), None);
        assert_eq!(Rollup::from_metric_name(""), None);
    }

    #[test]
    fn test_aggregate_shapes_names() {
        let v = aggregate("disk.usage.average", &series("scsi0", &[20, 30]));
        assert_eq!(v.measurement, "disk");
        assert_eq!(v.field_name, "disk_usage_average");
        assert_eq!(v.instance, "scsi0");
        assert_eq!(v.value, 25);
        assert!(!v.is_entity_level());
    }

    #[test]
    fn test_aggregate_normalises_instance() {
        let v = aggregate("net.bytesRx.average", &series("vmnic0.Port1", &[1]));
        assert_eq!(v.measurement, "net");
        assert_eq!(v.field_name, "net_bytesrx_average");
        assert_eq!(v.instance, "vmnic0_port1");
    }

    #[test]
    fn test_aggregate_datastore_never_split() {
        let v = aggregate(
            "datastore.totalReadLatency.average",
            &series("5f1e2a3b-datastore-uuid", &[4, 6]),
        );
        assert_eq!(v.instance, "");
        assert!(v.is_entity_level());
        assert_eq!(v.field_name, "datastore_totalreadlatency_average");
        assert_eq!(v.value, 5);

        let v = aggregate("virtualDisk.readLatencyDatastore.latest", &series("scsi0:0", &[7]));
        assert_eq!(v.instance, "");
    }

    #[test]
    fn test_aggregate_unknown_rollup() {
        let v = aggregate("cpu.usage.none", &series("", &[10, 20]));
        assert_eq!(v.value, NO_DATA);
        assert_eq!(v.field_name, "cpu_usage_none");
    }
}
