use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::catalog::MetricGroups;
use crate::vsphere::{ManagedObjectRef, PerfMetricId, PerfQuerySpec};

/// Real-time statistics bucket (20 second samples).
pub const REALTIME_INTERVAL_ID: i32 = 20;

/// Lag applied to the window end so the newest bucket is complete.
pub const FLUSH_LAG: Duration = Duration::from_secs(1);

/// Time window `[start, end]` covered by one polling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: SystemTime,
    pub end: SystemTime,
}

impl Window {
    /// Window of length `interval` ending one second before `now`.
    ///
    /// Both bounds are clamped to the Unix epoch.
    pub fn ending_at(now: SystemTime, interval: Duration) -> Self {
        let end = clamped_sub(now, FLUSH_LAG);
        let start = clamped_sub(end, interval);
        Self { start, end }
    }
}

// `SystemTime` can represent pre-epoch instants, so `checked_sub` alone does not clamp.
fn clamped_sub(t: SystemTime, d: Duration) -> SystemTime {
    t.checked_sub(d)
        .filter(|t| *t >= UNIX_EPOCH)
        .unwrap_or(UNIX_EPOCH)
}

/// Build one query per ref whose type has a non-empty metric group.
///
/// Order follows `refs`.
pub fn build_queries(
    refs: &[ManagedObjectRef],
    groups: &MetricGroups,
    window: Window,
) -> Vec<PerfQuerySpec> {
    refs.iter()
        .filter_map(|entity| {
            let group = groups.get(&entity.kind)?;
            if group.definitions.is_empty() {
                return None;
            }

            let metric_ids = group
                .definitions
                .iter()
                .map(|def| PerfMetricId {
                    counter_id: def.counter_id,
                    instance: def.instance_selector.clone(),
                })
                .collect();

            Some(PerfQuerySpec {
                entity: entity.clone(),
                start_time: window.start,
                end_time: window.end,
                metric_ids,
                interval_id: REALTIME_INTERVAL_ID,
            })
        })
        .collect()
}
