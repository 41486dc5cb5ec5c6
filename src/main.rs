//! DHT Agent - humidity/temperature telemetry over MQTT
//!
//! This service samples a DHT sensor every couple of minutes and publishes
//! temperature and humidity as separate JSON records to an MQTT broker. The
//! network link and broker session are re-established automatically whenever
//! they drop.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `DHT_AGENT_WIFI_SSID` / `DHT_AGENT_WIFI_PASSWORD`: network credentials
//! - `DHT_AGENT_BROKER_URI` / `DHT_AGENT_BROKER_PORT`: broker (default: mqtt://test.mosquitto.org:1883)
//! - `DHT_AGENT_CLIENT_ID`: broker client identifier (default: generated)
//! - `DHT_AGENT_TEMPERATURE_TOPIC` / `DHT_AGENT_HUMIDITY_TOPIC`: publish topics
//! - `DHT_AGENT_SAMPLE_INTERVAL_SECS`: seconds between samples (default: 120)
//! - `DHT_AGENT_RECONNECT_POLICY`: `immediate` or `backoff` (default: immediate)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dht_agent::bootstrap::{bootstrap, Collaborators, EVENT_CHANNEL_CAPACITY};
use dht_agent::config::Config;
use dht_agent::simulation::{
    SimulatedBroker, SimulatedDht, SimulatedNetwork, SimulatedStorage, SimulationConfig,
};

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting DHT agent...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                ssid = %config.wifi_ssid,
                broker = %config.endpoint(),
                client_id = %config.client_id,
                interval_secs = config.sample_interval.as_secs(),
                sensor = %config.sensor_model,
                reconnect = config.reconnect_policy.name(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    // Wire the simulated radio, broker client and sensor
    let sim = SimulationConfig::default();
    let (link_tx, link_events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (session_tx, session_events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let collaborators = Collaborators {
        storage: SimulatedStorage::default(),
        network: Arc::new(SimulatedNetwork::new(link_tx, sim.clone())),
        link_events,
        transport: Arc::new(SimulatedBroker::new(session_tx, &sim)),
        session_events,
        sensor: SimulatedDht::new(&sim),
    };

    let agent = match bootstrap(&config, collaborators).await {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "Failed to start agent");
            std::process::exit(1);
        }
    };

    // Wait for shutdown signal
    info!("DHT agent running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    let summary = serde_json::json!({
        "sensor": config.sensor_model,
        "link_state": agent.link().current_state(),
        "session_state": agent.session().current_state(),
        "link": agent.link_stats(),
        "session": agent.session_stats(),
        "loop": agent.loop_stats(),
    });
    agent.shutdown();

    info!(stats = %summary, "DHT agent stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
