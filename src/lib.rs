//! DHT Agent Library
//!
//! This library provides the components of a single-node telemetry agent that
//! samples a humidity/temperature sensor and publishes the readings to an MQTT
//! broker over a self-healing network connection:
//!
//! - **config**: Environment-based configuration for the agent
//! - **connectivity**: Network link state and unconditional reconnection
//! - **session**: Broker session lifecycle and best-effort publishing
//! - **sampler**: The periodic read-format-publish loop
//! - **measurement**: Interpreting scaled sensor values and rendering records
//! - **bootstrap**: Ordered startup of storage, link, session and loop
//! - **simulation**: Stand-ins for the radio, broker client and sensor driver
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dht_agent::bootstrap::{bootstrap, Collaborators, EVENT_CHANNEL_CAPACITY};
//! use dht_agent::config::Config;
//! use dht_agent::simulation::{
//!     SimulatedBroker, SimulatedDht, SimulatedNetwork, SimulatedStorage, SimulationConfig,
//! };
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let sim = SimulationConfig::default();
//!
//!     let (link_tx, link_events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
//!     let (session_tx, session_events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
//!
//!     let agent = bootstrap(
//!         &config,
//!         Collaborators {
//!             storage: SimulatedStorage::default(),
//!             network: Arc::new(SimulatedNetwork::new(link_tx, sim.clone())),
//!             link_events,
//!             transport: Arc::new(SimulatedBroker::new(session_tx, &sim)),
//!             session_events,
//!             sensor: SimulatedDht::new(&sim),
//!         },
//!     )
//!     .await
//!     .expect("Failed to start agent");
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     agent.shutdown();
//! }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

// Module declarations
pub mod bootstrap;
pub mod config;
pub mod connectivity;
pub mod measurement;
pub mod retry;
pub mod sampler;
pub mod sensor;
pub mod session;
pub mod simulation;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root for convenience
pub use bootstrap::{bootstrap, AgentHandle, BootstrapError, Collaborators, PersistentStorage, StorageError};
pub use config::{Config, ConfigError};
pub use connectivity::{ConnectivityManager, Credentials, LinkError, LinkEvent, LinkState, NetworkStack};
pub use measurement::{format_tenths, Measurement, MeasurementKind, PublishRecord, Topics};
pub use retry::RetryPolicy;
pub use sampler::{CycleOutcome, LoopConfig, LoopStats, SamplingLoop};
pub use sensor::{RawReading, Sensor, SensorModel, SensorReadError};
pub use session::{
    BrokerEndpoint, BrokerTransport, DeliveryLevel, PublishError, SessionError, SessionEvent,
    SessionManager, SessionState,
};

/// Lock a mutex, recovering the value if a holder panicked.
///
/// Every guarded value in this crate is a plain state enum or counter, so a
/// poisoned lock still holds a usable value.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
