//! Measurement module for interpreting raw sensor values and rendering publish records.
//!
//! The DHT family reports both quantities as scaled integers in tenths of a unit.
//! This module turns one raw value into a [`Measurement`] and a measurement into
//! the [`PublishRecord`] handed to the broker session.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::sensor::RawReading;

/// The quantity a measurement describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementKind {
    Temperature,
    Humidity,
}

impl MeasurementKind {
    /// Field name used in the JSON payload.
    pub fn name(&self) -> &'static str {
        match self {
            MeasurementKind::Temperature => "temperature",
            MeasurementKind::Humidity => "humidity",
        }
    }

    /// Unit suffix used in diagnostic log lines.
    pub fn unit(&self) -> &'static str {
        match self {
            MeasurementKind::Temperature => "°C",
            MeasurementKind::Humidity => "%",
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One interpreted sensor quantity.
///
/// The value is kept as sign, whole part and tenths digit so that `-0.5` keeps
/// its sign. Tenths are truncated from the sensor's native scale, never rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Measurement {
    /// Which quantity this is
    pub kind: MeasurementKind,

    /// True when the scaled value is below zero
    pub negative: bool,

    /// Whole units (magnitude)
    pub whole: u16,

    /// Tenths digit, always 0-9
    pub tenths: u8,

    /// When the underlying sensor read completed
    pub read_at: DateTime<Utc>,
}

impl Measurement {
    /// Build a measurement from a value expressed in tenths of a unit.
    pub fn from_tenths(kind: MeasurementKind, scaled: i16, read_at: DateTime<Utc>) -> Self {
        // i16::MIN has no positive counterpart in i16, so widen first.
        let magnitude = i32::from(scaled).unsigned_abs();

        Self {
            kind,
            negative: scaled < 0,
            whole: (magnitude / 10) as u16,
            tenths: (magnitude % 10) as u8,
            read_at,
        }
    }

    /// Split one atomic sensor read into its two measurements.
    ///
    /// Both share the same timestamp; they are not independent samples.
    pub fn pair_from_reading(reading: RawReading, read_at: DateTime<Utc>) -> [Measurement; 2] {
        [
            Self::from_tenths(MeasurementKind::Temperature, reading.temperature, read_at),
            Self::from_tenths(MeasurementKind::Humidity, reading.humidity, read_at),
        ]
    }

    /// The value back in tenths of a unit.
    pub fn scaled(&self) -> i32 {
        let magnitude = i32::from(self.whole) * 10 + i32::from(self.tenths);
        if self.negative {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Decimal text with exactly one fractional digit, e.g. `-5.2`.
    pub fn decimal(&self) -> String {
        let sign = if self.negative { "-" } else { "" };
        format!("{}{}.{}", sign, self.whole, self.tenths)
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.decimal(), self.kind.unit())
    }
}

/// Render a tenths-scaled integer as one-decimal text.
///
/// Formats from the absolute value with an explicit sign prefix, so `-52`
/// becomes `-5.2` and `-5` becomes `-0.5`.
pub fn format_tenths(scaled: i16) -> String {
    let magnitude = i32::from(scaled).unsigned_abs();
    let sign = if scaled < 0 { "-" } else { "" };
    format!("{}{}.{}", sign, magnitude / 10, magnitude % 10)
}

/// Topic names for each measurement kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub temperature: String,
    pub humidity: String,
}

impl Topics {
    pub fn new(temperature: impl Into<String>, humidity: impl Into<String>) -> Self {
        Self {
            temperature: temperature.into(),
            humidity: humidity.into(),
        }
    }

    /// Topic a measurement of the given kind is published to.
    pub fn for_kind(&self, kind: MeasurementKind) -> &str {
        match kind {
            MeasurementKind::Temperature => &self.temperature,
            MeasurementKind::Humidity => &self.humidity,
        }
    }
}

/// A topic/payload pair submitted to the broker for one measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub topic: String,
    pub payload: String,
}

impl PublishRecord {
    /// Derive the record for a measurement.
    ///
    /// Payload is a single-field JSON object: `{"temperature": -5.2}`.
    pub fn from_measurement(measurement: &Measurement, topics: &Topics) -> Self {
        Self {
            topic: topics.for_kind(measurement.kind).to_string(),
            payload: format!("{{\"{}\": {}}}", measurement.kind.name(), measurement.decimal()),
        }
    }
}
