//! Simulated collaborators for running the agent without hardware.
//!
//! The radio, the broker client and the sensor driver are external to this
//! crate. These stand-ins behave like them closely enough to exercise the
//! agent end to end: association and session establishment complete after a
//! short delay, the link occasionally drops, and the sensor drifts slowly with
//! the odd checksum failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bootstrap::{PersistentStorage, StorageError};
use crate::connectivity::{Credentials, LinkError, LinkEvent, NetworkStack};
use crate::lock;
use crate::measurement::format_tenths;
use crate::sensor::{RawReading, Sensor, SensorModel, SensorReadError};
use crate::session::{BrokerEndpoint, BrokerTransport, DeliveryLevel, SessionError, SessionEvent};

/// Tuning for the simulated collaborators.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Time from association request to `Connected`
    pub associate_delay: Duration,

    /// Time from session open request to `Connected`
    pub session_delay: Duration,

    /// Probability that an established link drops before the next check
    pub link_drop_rate: f64,

    /// How often the established link is checked for a simulated drop
    pub link_check_interval: Duration,

    /// Probability that a sensor read fails
    pub sensor_failure_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            associate_delay: Duration::from_millis(1_500),
            session_delay: Duration::from_millis(500),
            link_drop_rate: 0.05,
            link_check_interval: Duration::from_secs(60),
            sensor_failure_rate: 0.05, // 5% failed reads
        }
    }
}

/// Network stack that associates after a delay and drops the link now and then.
pub struct SimulatedNetwork {
    events: mpsc::Sender<LinkEvent>,
    config: SimulationConfig,
    // Bumped on every association so stale drop timers stand down
    generation: Arc<Mutex<u64>>,
}

impl SimulatedNetwork {
    pub fn new(events: mpsc::Sender<LinkEvent>, config: SimulationConfig) -> Self {
        Self {
            events,
            config,
            generation: Arc::new(Mutex::new(0)),
        }
    }
}

impl NetworkStack for SimulatedNetwork {
    fn associate(&self, credentials: &Credentials) -> Result<(), LinkError> {
        if credentials.ssid.is_empty() {
            return Err(LinkError::Association("empty SSID".to_string()));
        }

        let generation = {
            let mut current = lock(&self.generation);
            *current += 1;
            *current
        };

        let events = self.events.clone();
        let config = self.config.clone();
        let current = self.generation.clone();
        let ssid = credentials.ssid.clone();

        tokio::spawn(async move {
            tokio::time::sleep(config.associate_delay).await;
            debug!(ssid = %ssid, "Simulated association complete");
            if events.send(LinkEvent::Connected).await.is_err() {
                return;
            }

            let mut rng = StdRng::from_entropy();
            loop {
                tokio::time::sleep(config.link_check_interval).await;
                if *lock(&current) != generation {
                    return;
                }
                if rng.gen_bool(config.link_drop_rate) {
                    info!(ssid = %ssid, "Simulated beacon loss");
                    let _ = events.send(LinkEvent::Disconnected).await;
                    return;
                }
            }
        });

        Ok(())
    }
}

/// Broker transport that connects after a delay and logs what it publishes.
pub struct SimulatedBroker {
    events: mpsc::Sender<SessionEvent>,
    delay: Duration,
    connected: Arc<AtomicBool>,
}

impl SimulatedBroker {
    pub fn new(events: mpsc::Sender<SessionEvent>, config: &SimulationConfig) -> Self {
        Self {
            events,
            delay: config.session_delay,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl BrokerTransport for SimulatedBroker {
    fn open_session(&self, endpoint: &BrokerEndpoint, client_id: &str) -> Result<(), SessionError> {
        if endpoint.uri.is_empty() {
            return Err(SessionError::Open("empty broker URI".to_string()));
        }

        let events = self.events.clone();
        let delay = self.delay;
        let connected = self.connected.clone();
        debug!(broker = %endpoint, client_id = %client_id, "Simulated session opening");

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            connected.store(true, Ordering::SeqCst);
            let _ = events.send(SessionEvent::Connected).await;
        });

        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: &str,
        level: DeliveryLevel,
        retain: bool,
    ) -> Result<(), SessionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SessionError::Rejected("no broker connection".to_string()));
        }
        info!(
            topic = %topic,
            payload = %payload,
            qos = level.qos(),
            retain = retain,
            "Simulated publish"
        );
        Ok(())
    }
}

/// DHT sensor whose readings drift around typical indoor values.
pub struct SimulatedDht {
    rng: StdRng,
    humidity: i16,
    temperature: i16,
    failure_rate: f64,
}

impl SimulatedDht {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            humidity: 550,
            temperature: 215,
            failure_rate: config.sensor_failure_rate,
        }
    }

    fn step(&mut self, model: SensorModel) -> Result<RawReading, SensorReadError> {
        if self.rng.gen_bool(self.failure_rate) {
            let expected: u8 = self.rng.gen();
            return Err(SensorReadError::Checksum {
                expected,
                actual: expected.wrapping_add(1),
            });
        }

        self.humidity = (self.humidity + self.rng.gen_range(-15..=15)).clamp(200, 950);
        self.temperature = (self.temperature + self.rng.gen_range(-8..=8)).clamp(-400, 800);

        // The DHT11 only resolves whole units.
        let (humidity, temperature) = match model {
            SensorModel::Dht11 => (self.humidity / 10 * 10, self.temperature / 10 * 10),
            SensorModel::Dht22 => (self.humidity, self.temperature),
        };

        Ok(RawReading {
            humidity,
            temperature,
        })
    }
}

impl Sensor for SimulatedDht {
    async fn read(&mut self, model: SensorModel) -> Result<RawReading, SensorReadError> {
        // Start signal plus 40 data bits take a few milliseconds on the wire.
        tokio::time::sleep(Duration::from_millis(25)).await;
        let reading = self.step(model)?;
        debug!(
            humidity = %format_tenths(reading.humidity),
            temperature = %format_tenths(reading.temperature),
            "Simulated read"
        );
        Ok(reading)
    }
}

/// Storage that needs one erase on first boot.
#[derive(Debug, Default)]
pub struct SimulatedStorage {
    initialised: bool,
    formatted: bool,
}

impl PersistentStorage for SimulatedStorage {
    fn init(&mut self) -> Result<(), StorageError> {
        if !self.formatted {
            return Err(StorageError::NewVersionFound);
        }
        self.initialised = true;
        Ok(())
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        self.formatted = true;
        self.initialised = false;
        Ok(())
    }
}
