use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;

use crate::point::Point;

/// Timestamp precision of written points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Precision {
    #[default]
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "ms")]
    Milliseconds,
    #[serde(rename = "u", alias = "us")]
    Microseconds,
    #[serde(rename = "ns")]
    Nanoseconds,
}

impl Precision {
    /// Value of the `precision` query parameter.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Seconds => "s",
            Self::Milliseconds => "ms",
            Self::Microseconds => "u",
            Self::Nanoseconds => "ns",
        }
    }

    /// Timestamp of `t` in this precision, truncated. Pre-epoch times clamp to 0.
    pub fn timestamp(self, t: SystemTime) -> u128 {
        let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        match self {
            Self::Seconds => u128::from(d.as_secs()),
            Self::Milliseconds => d.as_millis(),
            Self::Microseconds => d.as_micros(),
            Self::Nanoseconds => d.as_nanos(),
        }
    }
}

fn escape_into(out: &mut String, s: &str, specials: &[char]) {
    for c in s.chars() {
        if c == '\\' || specials.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Append one point as a line (without trailing newline).
pub fn encode_point(out: &mut String, point: &Point, precision: Precision) {
    escape_into(out, &point.measurement, &[',', ' ']);

    for (key, value) in &point.tags {
        // Influx rejects empty tag values.
        if value.is_empty() {
            continue;
        }
        out.push(',');
        escape_into(out, key, &[',', '=', ' ']);
        out.push('=');
        escape_into(out, value, &[',', '=', ' ']);
    }

    let mut sep = ' ';
    for (key, value) in &point.fields {
        out.push(sep);
        sep = ',';
        escape_into(out, key, &[',', '=', ' ']);
        let _ = write!(out, "={value}i");
    }

    let _ = write!(out, " {}", precision.timestamp(point.timestamp));
}

/// Encode a batch of points, one line each. Points without fields are skipped.
pub fn encode(points: &[Point], precision: Precision) -> String {
    let mut out = String::with_capacity(points.len() * 128);
    for point in points.iter().filter(|p| !p.fields.is_empty()) {
        encode_point(&mut out, point, precision);
        out.push('\n');
    }
    out
}
