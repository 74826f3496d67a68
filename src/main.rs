use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use vsphere_influxdb::agent::Poller;
use vsphere_influxdb::config::Config;
use vsphere_influxdb::export::HealthMetrics;
use vsphere_influxdb::sink::InfluxWriter;
use vsphere_influxdb::vsphere::client::HttpConnector;

/// Collects vCenter performance counters into InfluxDB.
#[derive(Parser)]
#[command(name = "vsphere-influxdb", about)]
struct Cli {
    /// Path to the configuration file (YAML or legacy JSON).
    #[arg(short, long, default_value = "/etc/vsphere-influxdb.json")]
    config: PathBuf,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Verbose inventory dumps; same as `--log-level debug`.
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

mod version {
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("vsphere-influxdb {}", version::full());
        return Ok(());
    }

    let level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting vsphere-influxdb",
    );

    // Without a usable config the run polls nothing and still exits cleanly.
    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(
                path = %cli.config.display(),
                error = %format!("{e:#}"),
                "configuration unavailable, continuing with no sources",
            );
            Config::default()
        }
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);
    let sink = InfluxWriter::new(cfg.influxdb.clone()).context("creating InfluxDB writer")?;
    let connector = HttpConnector::new(cfg.vsphere.clone());
    let textfile = cfg.health.textfile_path.clone();

    let mut poller = Poller::new(cfg, connector, sink, Arc::clone(&health));
    tokio::spawn(cancel_on_signal(poller.cancel_token()));

    poller.init().await;
    poller.run_once().await;

    if !textfile.is_empty() {
        match health.write_textfile(Path::new(&textfile)) {
            Ok(()) => tracing::debug!(path = %textfile, "wrote health metrics"),
            Err(e) => tracing::warn!(path = %textfile, error = %e, "writing health metrics failed"),
        }
    }

    tracing::info!("vsphere-influxdb finished");

    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT, cancelling pass"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, cancelling pass"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, cancelling pass");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received SIGINT, cancelling pass");
    }

    cancel.cancel();
}
