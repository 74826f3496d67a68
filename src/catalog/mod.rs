use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::MetricSubscription;
use crate::vsphere::{PerfCounterInfo, Session};

/// A declared metric resolved against a vCenter's counter catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDefinition {
    /// Dotted `group.counter.rollup` name.
    pub name: String,
    /// "" (aggregate only), "*" (all instances) or an explicit instance id.
    pub instance_selector: String,
    pub counter_id: i32,
}

/// Resolved definitions applicable to one managed object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricGroup {
    pub object_type: String,
    pub definitions: Vec<MetricDefinition>,
}

/// Metric groups of one vCenter, in first-seen order of object type.
#[derive(Debug, Clone, Default)]
pub struct MetricGroups {
    groups: Vec<MetricGroup>,
}

impl MetricGroups {
    /// Returns the group for `object_type`, if any metric resolved for it.
    pub fn get(&self, object_type: &str) -> Option<&MetricGroup> {
        self.groups.iter().find(|g| g.object_type == object_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricGroup> {
        self.groups.iter()
    }

    pub fn object_types(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.object_type.as_str())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Counter id to metric name index used when decoding query results.
    pub fn counter_names(&self) -> HashMap<i32, String> {
        let mut names = HashMap::new();
        for def in self.groups.iter().flat_map(|g| g.definitions.iter()) {
            names.insert(def.counter_id, def.name.clone());
        }
        names
    }

    fn add(&mut self, object_type: &str, def: MetricDefinition) {
        match self
            .groups
            .iter_mut()
            .find(|g| g.object_type == object_type)
        {
            Some(group) => group.definitions.push(def),
            None => self.groups.push(MetricGroup {
                object_type: object_type.to_string(),
                definitions: vec![def],
            }),
        }
    }
}

/// Resolve declared metrics against a counter catalog.
///
/// Catalog order drives definition order. A declaration matching no catalog
/// entry is dropped.
pub fn resolve(catalog: &[PerfCounterInfo], subscriptions: &[MetricSubscription]) -> MetricGroups {
    let mut groups = MetricGroups::default();

    for counter in catalog {
        let identifier = counter.identifier();

        for subscription in subscriptions {
            for declaration in &subscription.definition {
                if declaration.metric != identifier {
                    continue;
                }

                let def = MetricDefinition {
                    name: declaration.metric.clone(),
                    instance_selector: declaration.instances.clone(),
                    counter_id: counter.key,
                };

                for object_type in &subscription.object_type {
                    groups.add(object_type, def.clone());
                }
            }
        }
    }

    groups
}

/// Declared metric names with no counter in `catalog`.
pub fn unresolved<'a>(
    catalog: &[PerfCounterInfo],
    subscriptions: &'a [MetricSubscription],
) -> Vec<&'a str> {
    let known: HashSet<String> =
        catalog.iter().map(PerfCounterInfo::identifier).collect();

    subscriptions
        .iter()
        .flat_map(|s| s.definition.iter())
        .map(|d| d.metric.as_str())
        .filter(|name| !known.contains(*name))
        .collect()
}

/// Fetch the performance manager's counter catalog.
pub async fn fetch_catalog<S: Session>(session: &S) -> Result<Vec<PerfCounterInfo>> {
    let perf_manager = session.service_content().perf_manager.clone();

    let content = session
        .retrieve_one(&perf_manager, &["perfCounter"])
        .await
        .context("retrieving performance counter catalog")?;

    let counters: Vec<PerfCounterInfo> = content.get("perfCounter")?.unwrap_or_default();

    debug!(counters = counters.len(), "fetched performance counter catalog");

    Ok(counters)
}
