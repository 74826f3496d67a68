pub mod influx;
pub mod line_protocol;

use anyhow::Result;

use crate::point::Point;

pub use influx::InfluxWriter;

/// Sink receives one batch of points per source pass.
pub trait Sink: Send + Sync {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Write a batch of points to `database`.
    fn write(
        &self,
        database: &str,
        points: &[Point],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
