use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use tracing::warn;

use crate::aggregate::{aggregate, AggregatedValue};
use crate::inventory::Inventory;
use crate::vsphere::EntityMetric;

/// One measurement ready for the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, i64>,
    pub timestamp: SystemTime,
}

/// Remove `domain` from the end of `name`. An empty domain is a no-op.
pub fn strip_domain<'a>(name: &'a str, domain: &str) -> &'a str {
    if domain.is_empty() {
        return name;
    }
    name.strip_suffix(domain).unwrap_or(name)
}

/// Turns per-entity query results into points for one source.
pub struct PointAssembler<'a> {
    source_host: String,
    domain: &'a str,
    inventory: &'a Inventory,
    counter_names: &'a HashMap<i32, String>,
}

/// Instance points of one entity keyed by (measurement, name, instance).
type InstanceKey = (String, String, String);

impl<'a> PointAssembler<'a> {
    pub fn new(
        source_hostname: &str,
        domain: &'a str,
        inventory: &'a Inventory,
        counter_names: &'a HashMap<i32, String>,
    ) -> Self {
        Self {
            source_host: strip_domain(source_hostname, domain).to_string(),
            domain,
            inventory,
            counter_names,
        }
    }

    /// Reduce every series of `results` and emit the resulting points.
    ///
    /// Returns the points and the number of series reduced.
    pub fn assemble(&self, results: &[EntityMetric]) -> (Vec<Point>, usize) {
        let mut points = Vec::new();
        let mut reduced = 0;

        for metric in results {
            reduced += self.assemble_entity(metric, &mut points);
        }

        (points, reduced)
    }

    fn assemble_entity(&self, metric: &EntityMetric, out: &mut Vec<Point>) -> usize {
        let timestamp = SystemTime::now();
        let entity = &metric.entity;

        let display_name = self.inventory.display_name(entity);
        let name = strip_domain(display_name, self.domain).to_lowercase();

        let mut tags = BTreeMap::new();
        tags.insert("host".to_string(), self.source_host.clone());
        tags.insert("name".to_string(), name.clone());
        if let Some(ctx) = self.inventory.context(entity) {
            for (key, value) in ctx.tags() {
                tags.insert(key.to_string(), value.to_string());
            }
        }

        let mut fields = BTreeMap::new();
        let mut instances: BTreeMap<InstanceKey, BTreeMap<String, i64>> = BTreeMap::new();
        let mut reduced = 0;

        for series in &metric.series {
            let Some(metric_name) = self.counter_names.get(&series.counter_id) else {
                warn!(
                    entity = %entity,
                    counter_id = series.counter_id,
                    "skipping series for unknown counter",
                );
                continue;
            };

            let AggregatedValue {
                measurement,
                instance,
                field_name,
                value,
                ..
            } = aggregate(metric_name, series);
            reduced += 1;

            if instance.is_empty() {
                fields.insert(field_name, value);
            } else {
                instances
                    .entry((measurement, name.clone(), instance))
                    .or_default()
                    .insert(field_name, value);
            }
        }

        if let Some(extra) = self.inventory.extra_fields(entity) {
            fields.extend(extra.iter().map(|(k, v)| (k.clone(), *v)));
        }

        if !fields.is_empty() {
            out.push(Point {
                measurement: entity.kind.to_lowercase(),
                tags: tags.clone(),
                fields,
                timestamp,
            });
        }

        let instance_time = SystemTime::now();
        for ((measurement, _, instance), fields) in instances {
            let mut instance_tags = tags.clone();
            instance_tags.insert("instance".to_string(), instance);
            out.push(Point {
                measurement,
                tags: instance_tags,
                fields,
                timestamp: instance_time,
            });
        }

        reduced
    }
}
