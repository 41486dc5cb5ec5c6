//! Sampling-publish loop.
//!
//! One cycle reads the sensor once, turns the reading into a temperature and a
//! humidity record, and publishes both. Failures never stop the loop: a failed
//! read skips the cycle, a failed publish drops that record. Cycles are spaced
//! by a fixed sleep that is not adjusted for the time the cycle took.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::measurement::{Measurement, MeasurementKind, PublishRecord, Topics};
use crate::sensor::{Sensor, SensorModel, SensorReadError};
use crate::session::{DeliveryLevel, PublishError, SessionManager};

/// Default time between cycle starts.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(120);

/// Settings for the sampling loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Sensor model passed to every read
    pub model: SensorModel,

    /// Sleep between cycles
    pub interval: Duration,

    /// Topic per measurement kind
    pub topics: Topics,

    /// Delivery level for every publish
    pub level: DeliveryLevel,

    /// Retain flag for every publish
    pub retain: bool,
}

/// Statistics about loop operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopStats {
    /// Cycles started
    pub cycles: u64,

    /// Cycles skipped because the sensor read failed
    pub sensor_failures: u64,

    /// Records accepted by the session
    pub records_published: u64,

    /// Records dropped (session not open or transport refusal)
    pub records_dropped: u64,
}

/// Result of a single cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The read failed; nothing was published
    SensorFailed(SensorReadError),

    /// Both records were attempted, each with its own result
    Attempted {
        temperature: Result<(), PublishError>,
        humidity: Result<(), PublishError>,
    },
}

/// The periodic read-format-publish driver.
pub struct SamplingLoop<S> {
    sensor: S,
    session: Arc<SessionManager>,
    config: LoopConfig,
    stats: Arc<RwLock<LoopStats>>,
}

impl<S: Sensor> SamplingLoop<S> {
    pub fn new(sensor: S, session: Arc<SessionManager>, config: LoopConfig) -> Self {
        Self {
            sensor,
            session,
            config,
            stats: Arc::new(RwLock::new(LoopStats::default())),
        }
    }

    /// Run one cycle without the trailing sleep.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.update_stats(|s| s.cycles += 1);

        let reading = match self.sensor.read(self.config.model).await {
            Ok(reading) => reading,
            Err(e) => {
                error!(error = %e, model = %self.config.model, "Failed to read sensor");
                self.update_stats(|s| s.sensor_failures += 1);
                return CycleOutcome::SensorFailed(e);
            }
        };

        let [temperature, humidity] = Measurement::pair_from_reading(reading, Utc::now());
        info!(
            humidity = %humidity,
            temperature = %temperature,
            "Sensor read"
        );

        // Both are attempted regardless of the first result.
        let temperature = self.publish(&temperature);
        let humidity = self.publish(&humidity);

        CycleOutcome::Attempted {
            temperature,
            humidity,
        }
    }

    /// Run cycles forever.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            model = %self.config.model,
            "Sampling loop started"
        );

        loop {
            let outcome = self.run_cycle().await;
            debug!(outcome = ?outcome, "Cycle complete");
            tokio::time::sleep(self.config.interval).await;
        }
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> LoopStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Shared statistics, readable after the loop has been moved into a task.
    pub fn stats_handle(&self) -> Arc<RwLock<LoopStats>> {
        self.stats.clone()
    }

    fn publish(&self, measurement: &Measurement) -> Result<(), PublishError> {
        let record = PublishRecord::from_measurement(measurement, &self.config.topics);
        let result = self
            .session
            .publish_record(&record, self.config.level, self.config.retain);

        match &result {
            Ok(()) => {
                self.update_stats(|s| s.records_published += 1);
                debug!(topic = %record.topic, payload = %record.payload, "Record published");
            }
            Err(e) => {
                self.update_stats(|s| s.records_dropped += 1);
                warn!(
                    error = %e,
                    kind = %measurement.kind,
                    topic = %record.topic,
                    "Dropping record"
                );
            }
        }

        result
    }

    fn update_stats(&self, f: impl FnOnce(&mut LoopStats)) {
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }
}

impl CycleOutcome {
    /// Result for one measurement kind, if the cycle got as far as publishing.
    pub fn result_for(&self, kind: MeasurementKind) -> Option<&Result<(), PublishError>> {
        match self {
            CycleOutcome::SensorFailed(_) => None,
            CycleOutcome::Attempted {
                temperature,
                humidity,
            } => Some(match kind {
                MeasurementKind::Temperature => temperature,
                MeasurementKind::Humidity => humidity,
            }),
        }
    }
}
