use std::io::Write;

use anyhow::{bail, Context, Result};

use super::line_protocol::encode;
use super::Sink;
use crate::config::InfluxDbConfig;
use crate::point::Point;

/// Writes points to the InfluxDB 1.x `/write` endpoint.
pub struct InfluxWriter {
    cfg: InfluxDbConfig,
    client: reqwest::Client,
}

impl InfluxWriter {
    pub fn new(cfg: InfluxDbConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self { cfg, client })
    }

    fn write_url(&self) -> String {
        format!("{}/write", self.cfg.hostname.trim_end_matches('/'))
    }
}

impl Sink for InfluxWriter {
    fn name(&self) -> &str {
        "influxdb"
    }

    async fn write(&self, database: &str, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let body = encode(points, self.cfg.precision);
        let raw_len = body.len();

        let compressed =
            compress(body.as_bytes(), &self.cfg.compression).context("compressing line protocol")?;

        let mut request = self
            .client
            .post(self.write_url())
            .query(&[("db", database), ("precision", self.cfg.precision.as_str())])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(compressed);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        if !self.cfg.username.is_empty() {
            request = request.basic_auth(&self.cfg.username, Some(&self.cfg.password));
        }

        let resp = request
            .send()
            .await
            .context("sending InfluxDB write request")?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            bail!("InfluxDB write unexpected status: {status}: {}", text.trim());
        }

        tracing::debug!(
            points = points.len(),
            bytes = raw_len,
            database,
            "wrote batch to InfluxDB",
        );

        Ok(())
    }
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}
