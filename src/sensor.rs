//! Sensor capability contract.
//!
//! The bit-level DHT protocol lives outside this crate. The agent only needs a
//! single operation: read one humidity/temperature pair for a given sensor model.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::Serialize;

/// Supported sensor models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorModel {
    Dht11,
    Dht22,
}

impl SensorModel {
    pub fn name(&self) -> &'static str {
        match self {
            SensorModel::Dht11 => "dht11",
            SensorModel::Dht22 => "dht22",
        }
    }
}

impl fmt::Display for SensorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SensorModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dht11" => Ok(SensorModel::Dht11),
            "dht22" | "am2301" => Ok(SensorModel::Dht22),
            other => Err(format!("unknown sensor model '{}'", other)),
        }
    }
}

/// One atomic read result, both values in tenths of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawReading {
    pub humidity: i16,
    pub temperature: i16,
}

/// Errors reported by the sensor driver.
///
/// All of them are transient from the agent's point of view: the cycle is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorReadError {
    /// The sensor did not answer the start signal
    NoResponse,

    /// A bit phase did not complete in time
    Timeout,

    /// The transmitted checksum did not match the data bytes
    Checksum { expected: u8, actual: u8 },

    /// Driver-level failure (bus busy, pin misconfigured)
    Driver(String),
}

impl fmt::Display for SensorReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorReadError::NoResponse => write!(f, "Sensor did not respond"),
            SensorReadError::Timeout => write!(f, "Sensor read timed out"),
            SensorReadError::Checksum { expected, actual } => write!(
                f,
                "Sensor checksum mismatch (expected {:#04x}, got {:#04x})",
                expected, actual
            ),
            SensorReadError::Driver(e) => write!(f, "Sensor driver error: {}", e),
        }
    }
}

impl std::error::Error for SensorReadError {}

/// Read capability for a humidity/temperature sensor.
///
/// A read suspends the calling task for the protocol-defined duration.
pub trait Sensor: Send {
    fn read(
        &mut self,
        model: SensorModel,
    ) -> impl Future<Output = Result<RawReading, SensorReadError>> + Send;
}
