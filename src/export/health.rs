use std::path::Path;

use anyhow::{Context, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Prometheus metrics describing collection health.
///
/// All metrics use the "vsphere_influxdb" namespace. The registry is shared
/// by every source of a run and rendered once the pass completes.
pub struct HealthMetrics {
    registry: Registry,

    /// Source passes by outcome (ok, error, timeout, sink_error, skipped).
    pub cycles_total: CounterVec,
    /// Wall time of one source pass.
    pub cycle_duration: HistogramVec,
    /// Points handed to the sink per source.
    pub points_written: CounterVec,
    /// Raw series reduced to a single value.
    pub series_reduced: Counter,
    /// Failed sink writes.
    pub sink_errors: Counter,
    /// Number of configured vCenters.
    pub sources_configured: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let cycles_total = CounterVec::new(
            Opts::new("cycles_total", "Source polling passes by outcome.")
                .namespace("vsphere_influxdb"),
            &["source", "status"],
        )?;
        let cycle_duration = HistogramVec::new(
            HistogramOpts::new(
                "cycle_duration_seconds",
                "Duration of one source polling pass.",
            )
            .namespace("vsphere_influxdb")
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["source"],
        )?;
        let points_written = CounterVec::new(
            Opts::new("points_written_total", "Points written to the sink.")
                .namespace("vsphere_influxdb"),
            &["source"],
        )?;
        let series_reduced = Counter::with_opts(
            Opts::new(
                "series_reduced_total",
                "Performance series reduced to a single value.",
            )
            .namespace("vsphere_influxdb"),
        )?;
        let sink_errors = Counter::with_opts(
            Opts::new("sink_errors_total", "Failed sink writes.").namespace("vsphere_influxdb"),
        )?;
        let sources_configured = Gauge::with_opts(
            Opts::new("sources_configured", "Number of configured vCenters.")
                .namespace("vsphere_influxdb"),
        )?;

        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(points_written.clone()))?;
        registry.register(Box::new(series_reduced.clone()))?;
        registry.register(Box::new(sink_errors.clone()))?;
        registry.register(Box::new(sources_configured.clone()))?;

        Ok(Self {
            registry,
            cycles_total,
            cycle_duration,
            points_written,
            series_reduced,
            sink_errors,
            sources_configured,
        })
    }

    /// Counts one finished source pass.
    pub fn record_cycle(&self, source: &str, status: &str, seconds: f64) {
        self.cycles_total
            .with_label_values(&[source, status])
            .inc();
        self.cycle_duration
            .with_label_values(&[source])
            .observe(seconds);
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Writes the rendered metrics for the node-exporter textfile collector.
    ///
    /// The file is written next to `path` and renamed into place.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        let text = self.render()?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");

        std::fs::write(&tmp, text)
            .with_context(|| format!("writing {}", Path::new(&tmp).display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_namespaced_metrics() {
        let health = HealthMetrics::new().expect("health metrics");
        health.record_cycle("vc01", "ok", 1.5);
        health.points_written.with_label_values(&["vc01"]).inc_by(3.0);
        health.series_reduced.inc_by(7.0);
        health.sources_configured.set(2.0);

        let text = health.render().expect("render");
        assert!(text.contains("vsphere_influxdb_cycles_total{source=\"vc01\",status=\"ok\"} 1"));
        assert!(text.contains("vsphere_influxdb_points_written_total{source=\"vc01\"} 3"));
        assert!(text.contains("vsphere_influxdb_series_reduced_total 7"));
        assert!(text.contains("vsphere_influxdb_sources_configured 2"));
        assert!(text.contains("vsphere_influxdb_cycle_duration_seconds_count{source=\"vc01\"} 1"));
    }

    #[test]
    fn test_write_textfile() {
        let dir = std::env::temp_dir().join(format!("vsphere-influxdb-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("vsphere.prom");

        let health = HealthMetrics::new().expect("health metrics");
        health.sink_errors.inc();
        health.write_textfile(&path).expect("write textfile");

        let text = std::fs::read_to_string(&path).expect("read textfile");
        assert!(text.contains("vsphere_influxdb_sink_errors_total 1"));

        std::fs::remove_dir_all(&dir).expect("cleanup");
    }
}
