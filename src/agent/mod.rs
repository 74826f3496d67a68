use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{self, MetricGroups};
use crate::config::{Config, SchedulingMode, VCenterConfig};
use crate::export::HealthMetrics;
use crate::inventory;
use crate::point::{Point, PointAssembler};
use crate::query::{build_queries, Window};
use crate::sink::Sink;
use crate::vsphere::{Connector, Session};

/// A monitored vCenter with its resolved metric groups.
#[derive(Debug, Clone)]
pub struct Source {
    pub vcenter: VCenterConfig,
    pub groups: MetricGroups,
    pub counter_names: HashMap<i32, String>,
}

impl Source {
    pub fn new(vcenter: VCenterConfig, groups: MetricGroups) -> Self {
        let counter_names = groups.counter_names();
        Self {
            vcenter,
            groups,
            counter_names,
        }
    }
}

/// Outcome of one source within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Ok,
    Error,
    Timeout,
    SinkError,
    Skipped,
    Cancelled,
}

impl SourceStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::SinkError => "sink_error",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOutcome {
    pub source: String,
    pub status: SourceStatus,
    pub points: usize,
}

/// Per-source outcomes of one pass, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct PassSummary {
    pub outcomes: Vec<SourceOutcome>,
}

impl PassSummary {
    pub fn count(&self, status: SourceStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn points_written(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == SourceStatus::Ok)
            .map(|o| o.points)
            .sum()
    }
}

/// Poller resolves counters once per source, then polls every source.
pub struct Poller<C, W> {
    cfg: Arc<Config>,
    connector: Arc<C>,
    sink: Arc<W>,
    health: Arc<HealthMetrics>,
    sources: Vec<Arc<Source>>,
    cancel: CancellationToken,
}

impl<C, W> Poller<C, W>
where
    C: Connector + 'static,
    W: Sink + 'static,
{
    pub fn new(cfg: Config, connector: C, sink: W, health: Arc<HealthMetrics>) -> Self {
        health.sources_configured.set(cfg.vcenters.len() as f64);

        Self {
            cfg: Arc::new(cfg),
            connector: Arc::new(connector),
            sink: Arc::new(sink),
            health,
            sources: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token cancelling the setup phase and any pass in progress.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn sources(&self) -> &[Arc<Source>] {
        &self.sources
    }

    /// Resolve each source's declared metrics against its counter catalog.
    ///
    /// A source that cannot be reached keeps empty groups and is skipped by
    /// later passes.
    pub async fn init(&mut self) {
        let mut sources = Vec::with_capacity(self.cfg.vcenters.len());

        for vcenter in &self.cfg.vcenters {
            let groups = tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!(source = %vcenter.hostname, "setup cancelled");
                    MetricGroups::default()
                }
                result = resolve_source(self.connector.as_ref(), &self.cfg, vcenter) => {
                    match result {
                        Ok(groups) => groups,
                        Err(e) => {
                            error!(
                                source = %vcenter.hostname,
                                error = %format!("{e:#}"),
                                "resolving metrics failed",
                            );
                            MetricGroups::default()
                        }
                    }
                }
            };

            info!(
                source = %vcenter.hostname,
                object_types = groups.len(),
                "metric groups resolved",
            );

            sources.push(Arc::new(Source::new(vcenter.clone(), groups)));
        }

        self.sources = sources;
    }

    /// Run one polling pass over every source.
    pub async fn run_once(&self) -> PassSummary {
        let outcomes = match self.cfg.scheduling.mode {
            SchedulingMode::Sequential => self.run_sequential().await,
            SchedulingMode::Concurrent => self.run_concurrent().await,
        };

        let summary = PassSummary { outcomes };

        info!(
            sources = summary.outcomes.len(),
            ok = summary.count(SourceStatus::Ok),
            failed = summary.count(SourceStatus::Error)
                + summary.count(SourceStatus::Timeout)
                + summary.count(SourceStatus::SinkError),
            points = summary.points_written(),
            "polling pass complete",
        );

        summary
    }

    async fn run_sequential(&self) -> Vec<SourceOutcome> {
        let mut outcomes = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            if self.cancel.is_cancelled() {
                outcomes.push(cancelled(source));
                continue;
            }

            let outcome = poll_source(
                self.connector.as_ref(),
                self.sink.as_ref(),
                &self.cfg,
                source,
                &self.health,
                &self.cancel,
            )
            .await;
            outcomes.push(outcome);
        }

        outcomes
    }

    async fn run_concurrent(&self) -> Vec<SourceOutcome> {
        let sched = &self.cfg.scheduling;
        let semaphore = Arc::new(Semaphore::new(sched.max_concurrent.max(1)));
        let deadline = sched.source_timeout;

        let mut in_flight = tokio::task::JoinSet::new();

        for (index, source) in self.sources.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let connector = Arc::clone(&self.connector);
            let sink = Arc::clone(&self.sink);
            let cfg = Arc::clone(&self.cfg);
            let health = Arc::clone(&self.health);
            let cancel = self.cancel.clone();
            let source = Arc::clone(source);

            in_flight.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, cancelled(&source));
                };

                if cancel.is_cancelled() {
                    return (index, cancelled(&source));
                }

                let started = Instant::now();
                let poll = poll_source(
                    connector.as_ref(),
                    sink.as_ref(),
                    &cfg,
                    &source,
                    &health,
                    &cancel,
                );

                if deadline.is_zero() {
                    return (index, poll.await);
                }

                let outcome = match tokio::time::timeout(deadline, poll).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            source = %source.vcenter.hostname,
                            timeout = ?deadline,
                            "source pass timed out",
                        );
                        health.record_cycle(
                            &source.vcenter.hostname,
                            SourceStatus::Timeout.as_str(),
                            started.elapsed().as_secs_f64(),
                        );
                        SourceOutcome {
                            source: source.vcenter.hostname.clone(),
                            status: SourceStatus::Timeout,
                            points: 0,
                        }
                    }
                };

                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<SourceOutcome>> = vec![None; self.sources.len()];
        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    if let Some(slot) = outcomes.get_mut(index) {
                        *slot = Some(outcome);
                    }
                }
                Err(e) => error!(error = %e, "source task failed"),
            }
        }

        outcomes
            .into_iter()
            .zip(&self.sources)
            .map(|(outcome, source)| {
                outcome.unwrap_or_else(|| SourceOutcome {
                    source: source.vcenter.hostname.clone(),
                    status: SourceStatus::Error,
                    points: 0,
                })
            })
            .collect()
    }
}

fn cancelled(source: &Source) -> SourceOutcome {
    SourceOutcome {
        source: source.vcenter.hostname.clone(),
        status: SourceStatus::Cancelled,
        points: 0,
    }
}

async fn resolve_source<C: Connector>(
    connector: &C,
    cfg: &Config,
    vcenter: &VCenterConfig,
) -> Result<MetricGroups> {
    let session = connector
        .connect(vcenter)
        .await
        .with_context(|| format!("connecting to {}", vcenter.hostname))?;

    let result = catalog::fetch_catalog(&session).await;
    logout(&session, &vcenter.hostname).await;
    let counters = result?;

    for metric in catalog::unresolved(&counters, &cfg.metrics) {
        debug!(source = %vcenter.hostname, metric, "metric not found in counter catalog");
    }

    Ok(catalog::resolve(&counters, &cfg.metrics))
}

/// Connect, collect and write one source. Never fails; the outcome is
/// logged and recorded in the health metrics.
///
/// Cancellation interrupts connecting or collecting. An open session is
/// still logged out and nothing is written.
pub async fn poll_source<C: Connector, W: Sink>(
    connector: &C,
    sink: &W,
    cfg: &Config,
    source: &Source,
    health: &HealthMetrics,
    cancel: &CancellationToken,
) -> SourceOutcome {
    let hostname = source.vcenter.hostname.as_str();
    let started = Instant::now();

    let (status, points) = poll_source_inner(connector, sink, cfg, source, health, cancel).await;

    health.record_cycle(hostname, status.as_str(), started.elapsed().as_secs_f64());

    SourceOutcome {
        source: hostname.to_string(),
        status,
        points,
    }
}

async fn poll_source_inner<C: Connector, W: Sink>(
    connector: &C,
    sink: &W,
    cfg: &Config,
    source: &Source,
    health: &HealthMetrics,
    cancel: &CancellationToken,
) -> (SourceStatus, usize) {
    let hostname = source.vcenter.hostname.as_str();

    if source.groups.is_empty() {
        debug!(source = %hostname, "no metric groups resolved, skipping");
        return (SourceStatus::Skipped, 0);
    }

    let connected = tokio::select! {
        _ = cancel.cancelled() => None,
        connected = connector.connect(&source.vcenter) => Some(connected),
    };

    let session = match connected {
        None => {
            info!(source = %hostname, "pass cancelled while connecting");
            return (SourceStatus::Cancelled, 0);
        }
        Some(Ok(session)) => session,
        Some(Err(e)) => {
            error!(source = %hostname, error = %format!("{e:#}"), "connecting to vCenter failed");
            return (SourceStatus::Error, 0);
        }
    };

    let collected = tokio::select! {
        _ = cancel.cancelled() => None,
        collected = collect(&session, cfg, source, health) => Some(collected),
    };
    logout(&session, hostname).await;

    let points = match collected {
        None => {
            info!(source = %hostname, "pass cancelled while collecting, nothing written");
            return (SourceStatus::Cancelled, 0);
        }
        Some(Ok(points)) => points,
        Some(Err(e)) => {
            error!(source = %hostname, error = %format!("{e:#}"), "collecting metrics failed");
            return (SourceStatus::Error, 0);
        }
    };

    if points.is_empty() {
        debug!(source = %hostname, "no points collected");
        return (SourceStatus::Ok, 0);
    }

    match sink.write(&cfg.influxdb.database, &points).await {
        Ok(()) => {
            health
                .points_written
                .with_label_values(&[hostname])
                .inc_by(points.len() as f64);
            info!(
                source = %hostname,
                sink = sink.name(),
                points = points.len(),
                "sent data to sink",
            );
            (SourceStatus::Ok, points.len())
        }
        Err(e) => {
            health.sink_errors.inc();
            error!(
                source = %hostname,
                sink = sink.name(),
                error = %format!("{e:#}"),
                "writing points failed, batch dropped",
            );
            (SourceStatus::SinkError, 0)
        }
    }
}

/// Enumerate, query and assemble the points of one source.
async fn collect<S: Session>(
    session: &S,
    cfg: &Config,
    source: &Source,
    health: &HealthMetrics,
) -> Result<Vec<Point>> {
    let hostname = source.vcenter.hostname.as_str();

    let inventory = inventory::enumerate(session, &source.groups)
        .await
        .context("enumerating inventory")?;

    let window = Window::ending_at(SystemTime::now(), cfg.interval);
    let specs = build_queries(&inventory.refs, &source.groups, window);
    debug!(
        source = %hostname,
        objects = inventory.refs.len(),
        queries = specs.len(),
        "built performance queries",
    );

    if specs.is_empty() {
        return Ok(Vec::new());
    }

    let results = session
        .query_perf(&specs)
        .await
        .context("querying performance data")?;

    let assembler =
        PointAssembler::new(hostname, &cfg.domain, &inventory, &source.counter_names);
    let (points, reduced) = assembler.assemble(&results);
    health.series_reduced.inc_by(reduced as f64);

    Ok(points)
}

async fn logout<S: Session>(session: &S, hostname: &str) {
    if let Err(e) = session.logout().await {
        warn!(source = %hostname, error = %e, "logout failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: SourceStatus, points: usize) -> SourceOutcome {
        SourceOutcome {
            source: "vc01".to_string(),
            status,
            points,
        }
    }

    #[test]
    fn test_pass_summary() {
        let summary = PassSummary {
            outcomes: vec![
                outcome(SourceStatus::Ok, 10),
                outcome(SourceStatus::Ok, 5),
                outcome(SourceStatus::SinkError, 0),
                outcome(SourceStatus::Timeout, 0),
            ],
        };

        assert_eq!(summary.count(SourceStatus::Ok), 2);
        assert_eq!(summary.count(SourceStatus::Timeout), 1);
        assert_eq!(summary.count(SourceStatus::Error), 0);
        assert_eq!(summary.points_written(), 15);
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(SourceStatus::SinkError.to_string(), "sink_error");
        assert_eq!(SourceStatus::Skipped.as_str(), "skipped");
    }

    #[test]
    fn test_source_indexes_counter_names() {
        let source = Source::new(VCenterConfig::default(), MetricGroups::default());
        assert!(source.counter_names.is_empty());
        assert!(source.groups.is_empty());
    }
}
