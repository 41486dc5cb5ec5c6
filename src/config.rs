//! Configuration module for the DHT agent.
//!
//! This module provides environment-based configuration: network credentials,
//! broker endpoint and identity, publish topics, sampling cadence and the
//! reconnect policy. Everything is read once at startup and never changes.

use std::env;
use std::time::Duration;

use uuid::Uuid;

use crate::connectivity::Credentials;
use crate::measurement::Topics;
use crate::retry::{RetryPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS};
use crate::sampler::LoopConfig;
use crate::sensor::SensorModel;
use crate::session::{BrokerEndpoint, DeliveryLevel};

/// Default network name
const DEFAULT_WIFI_SSID: &str = "dht-agent";

/// Default MQTT broker (public test broker)
const DEFAULT_BROKER_URI: &str = "mqtt://test.mosquitto.org";

/// Default MQTT port
const DEFAULT_BROKER_PORT: u16 = 1883;

const DEFAULT_TEMPERATURE_TOPIC: &str = "dht-agent/temperature";
const DEFAULT_HUMIDITY_TOPIC: &str = "dht-agent/humidity";

/// Default sample interval in seconds (two minutes between cycle starts)
const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 120;

/// Minimum sample interval; the DHT11 cannot be read more than once a second
const MIN_SAMPLE_INTERVAL_SECS: u64 = 1;

/// Maximum sample interval
const MAX_SAMPLE_INTERVAL_SECS: u64 = 3_600;

/// 802.11 limits
const MAX_SSID_LEN: usize = 32;
const MAX_PASSWORD_LEN: usize = 64;

/// Configuration for the DHT agent.
///
/// All settings can be configured via environment variables:
/// - `DHT_AGENT_WIFI_SSID` / `DHT_AGENT_WIFI_PASSWORD`: network credentials
/// - `DHT_AGENT_BROKER_URI` / `DHT_AGENT_BROKER_PORT`: broker endpoint (default: mqtt://test.mosquitto.org:1883)
/// - `DHT_AGENT_CLIENT_ID`: broker client identifier (default: generated)
/// - `DHT_AGENT_TEMPERATURE_TOPIC` / `DHT_AGENT_HUMIDITY_TOPIC`: publish topics
/// - `DHT_AGENT_SAMPLE_INTERVAL_SECS`: seconds between cycles (default: 120)
/// - `DHT_AGENT_SENSOR_MODEL`: `dht11` or `dht22` (default: dht11)
/// - `DHT_AGENT_QOS` / `DHT_AGENT_RETAIN`: publish options (default: 1 / false)
/// - `DHT_AGENT_RECONNECT_POLICY`: `immediate` or `backoff` (default: immediate)
/// - `DHT_AGENT_RECONNECT_BASE_MS` / `DHT_AGENT_RECONNECT_MAX_MS`: backoff tuning
#[derive(Debug, Clone)]
pub struct Config {
    /// Network name to associate with
    pub wifi_ssid: String,

    /// Network secret, empty for open networks
    pub wifi_password: String,

    /// Broker URI
    pub broker_uri: String,

    /// Broker port
    pub broker_port: u16,

    /// Client identifier presented to the broker
    pub client_id: String,

    /// Topic for temperature records
    pub temperature_topic: String,

    /// Topic for humidity records
    pub humidity_topic: String,

    /// Sleep between sampling cycles
    pub sample_interval: Duration,

    /// Sensor model on the data pin
    pub sensor_model: SensorModel,

    /// Delivery level for every publish
    pub qos: DeliveryLevel,

    /// Retain flag for every publish
    pub retain: bool,

    /// How link reconnection attempts are paced
    pub reconnect_policy: RetryPolicy,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Returns a new `Config` instance with values from environment variables,
    /// falling back to defaults where a variable is unset.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any variable is set to an invalid value, e.g.
    /// an out-of-range interval, an unknown sensor model, or a topic with
    /// wildcard characters.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use dht_agent::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Broker: {}:{}", config.broker_uri, config.broker_port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let wifi_ssid = Self::parse_ssid()?;
        let wifi_password = Self::parse_password()?;

        let broker_uri = Self::parse_non_empty("DHT_AGENT_BROKER_URI", DEFAULT_BROKER_URI)?;
        let broker_port = Self::parse_port()?;

        let client_id = match env::var("DHT_AGENT_CLIENT_ID") {
            Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => generate_client_id(),
        };

        let temperature_topic =
            Self::parse_topic("DHT_AGENT_TEMPERATURE_TOPIC", DEFAULT_TEMPERATURE_TOPIC)?;
        let humidity_topic = Self::parse_topic("DHT_AGENT_HUMIDITY_TOPIC", DEFAULT_HUMIDITY_TOPIC)?;

        let sample_interval = Duration::from_secs(Self::parse_sample_interval()?);

        let sensor_model = match env::var("DHT_AGENT_SENSOR_MODEL") {
            Ok(value) => value
                .parse()
                .map_err(|e: String| ConfigError::for_var("DHT_AGENT_SENSOR_MODEL", e))?,
            Err(_) => SensorModel::Dht11,
        };

        let qos = Self::parse_qos()?;
        let retain = Self::parse_bool("DHT_AGENT_RETAIN", false)?;
        let reconnect_policy = Self::parse_reconnect_policy()?;

        Ok(Self {
            wifi_ssid,
            wifi_password,
            broker_uri,
            broker_port,
            client_id,
            temperature_topic,
            humidity_topic,
            sample_interval,
            sensor_model,
            qos,
            retain,
            reconnect_policy,
        })
    }

    /// Network credentials for the connectivity manager.
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.wifi_ssid.clone(), self.wifi_password.clone())
    }

    /// Broker endpoint for the session manager.
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            uri: self.broker_uri.clone(),
            port: self.broker_port,
        }
    }

    pub fn topics(&self) -> Topics {
        Topics::new(self.temperature_topic.clone(), self.humidity_topic.clone())
    }

    /// Settings for the sampling loop.
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            model: self.sensor_model,
            interval: self.sample_interval,
            topics: self.topics(),
            level: self.qos,
            retain: self.retain,
        }
    }

    fn parse_ssid() -> Result<String, ConfigError> {
        let env_var = "DHT_AGENT_WIFI_SSID";

        match env::var(env_var) {
            Ok(value) => {
                if value.is_empty() {
                    return Err(ConfigError::for_var(env_var, "SSID must not be empty"));
                }
                if value.len() > MAX_SSID_LEN {
                    return Err(ConfigError::for_var(
                        env_var,
                        format!("SSID exceeds {} bytes", MAX_SSID_LEN),
                    ));
                }
                Ok(value)
            }
            Err(_) => Ok(DEFAULT_WIFI_SSID.to_string()),
        }
    }

    fn parse_password() -> Result<String, ConfigError> {
        let env_var = "DHT_AGENT_WIFI_PASSWORD";
        let value = env::var(env_var).unwrap_or_default();

        if value.len() > MAX_PASSWORD_LEN {
            return Err(ConfigError::for_var(
                env_var,
                format!("password exceeds {} bytes", MAX_PASSWORD_LEN),
            ));
        }
        Ok(value)
    }

    fn parse_non_empty(env_var: &str, default: &str) -> Result<String, ConfigError> {
        match env::var(env_var) {
            Ok(value) => {
                let value = value.trim();
                if value.is_empty() {
                    return Err(ConfigError::for_var(env_var, "value must not be empty"));
                }
                Ok(value.to_string())
            }
            Err(_) => Ok(default.to_string()),
        }
    }

    fn parse_topic(env_var: &str, default: &str) -> Result<String, ConfigError> {
        let topic = Self::parse_non_empty(env_var, default)?;
        if topic.contains(['+', '#']) {
            return Err(ConfigError::for_var(
                env_var,
                format!("'{}' contains wildcard characters", topic),
            ));
        }
        Ok(topic)
    }

    fn parse_port() -> Result<u16, ConfigError> {
        let env_var = "DHT_AGENT_BROKER_PORT";

        match env::var(env_var) {
            Ok(value) => {
                let port: u16 = value.parse().map_err(|_| {
                    ConfigError::for_var(env_var, format!("'{}' is not a valid port", value))
                })?;
                if port == 0 {
                    return Err(ConfigError::for_var(env_var, "port must be greater than 0"));
                }
                Ok(port)
            }
            Err(_) => Ok(DEFAULT_BROKER_PORT),
        }
    }

    /// Parse sample interval from environment variable with validation.
    fn parse_sample_interval() -> Result<u64, ConfigError> {
        let env_var = "DHT_AGENT_SAMPLE_INTERVAL_SECS";

        match env::var(env_var) {
            Ok(value) => {
                let interval: u64 = value.parse().map_err(|_| {
                    ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))
                })?;

                if interval < MIN_SAMPLE_INTERVAL_SECS {
                    return Err(ConfigError::for_var(
                        env_var,
                        format!(
                            "sample interval {} is below minimum ({}s)",
                            interval, MIN_SAMPLE_INTERVAL_SECS
                        ),
                    ));
                }

                if interval > MAX_SAMPLE_INTERVAL_SECS {
                    return Err(ConfigError::for_var(
                        env_var,
                        format!(
                            "sample interval {} exceeds maximum ({}s)",
                            interval, MAX_SAMPLE_INTERVAL_SECS
                        ),
                    ));
                }

                Ok(interval)
            }
            Err(_) => Ok(DEFAULT_SAMPLE_INTERVAL_SECS),
        }
    }

    fn parse_qos() -> Result<DeliveryLevel, ConfigError> {
        let env_var = "DHT_AGENT_QOS";

        match env::var(env_var) {
            Ok(value) => {
                let qos: u8 = value.parse().map_err(|_| {
                    ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))
                })?;
                DeliveryLevel::try_from(qos).map_err(|e| ConfigError::for_var(env_var, e))
            }
            Err(_) => Ok(DeliveryLevel::AtLeastOnce),
        }
    }

    fn parse_bool(env_var: &str, default: bool) -> Result<bool, ConfigError> {
        match env::var(env_var) {
            Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::for_var(
                    env_var,
                    format!("'{}' is not a valid boolean", value),
                )),
            },
            Err(_) => Ok(default),
        }
    }

    fn parse_millis(env_var: &str, default: u64) -> Result<Duration, ConfigError> {
        match env::var(env_var) {
            Ok(value) => {
                let millis: u64 = value.parse().map_err(|_| {
                    ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))
                })?;
                if millis == 0 {
                    return Err(ConfigError::for_var(env_var, "delay must be greater than 0"));
                }
                Ok(Duration::from_millis(millis))
            }
            Err(_) => Ok(Duration::from_millis(default)),
        }
    }

    fn parse_reconnect_policy() -> Result<RetryPolicy, ConfigError> {
        let env_var = "DHT_AGENT_RECONNECT_POLICY";
        let policy = env::var(env_var).unwrap_or_else(|_| "immediate".to_string());

        match policy.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(RetryPolicy::Immediate),
            "backoff" => {
                let base = Self::parse_millis("DHT_AGENT_RECONNECT_BASE_MS", DEFAULT_BASE_DELAY_MS)?;
                let max = Self::parse_millis("DHT_AGENT_RECONNECT_MAX_MS", DEFAULT_MAX_DELAY_MS)?;
                if max < base {
                    return Err(ConfigError::for_var(
                        "DHT_AGENT_RECONNECT_MAX_MS",
                        "maximum delay is below the base delay",
                    ));
                }
                Ok(RetryPolicy::Backoff { base, max })
            }
            other => Err(ConfigError::for_var(
                env_var,
                format!("unknown reconnect policy '{}'", other),
            )),
        }
    }
}

/// Client identifier used when none is configured.
fn generate_client_id() -> String {
    format!("dht-agent-{}", Uuid::new_v4().simple())
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            wifi_ssid: DEFAULT_WIFI_SSID.to_string(),
            wifi_password: String::new(),
            broker_uri: DEFAULT_BROKER_URI.to_string(),
            broker_port: DEFAULT_BROKER_PORT,
            client_id: generate_client_id(),
            temperature_topic: DEFAULT_TEMPERATURE_TOPIC.to_string(),
            humidity_topic: DEFAULT_HUMIDITY_TOPIC.to_string(),
            sample_interval: Duration::from_secs(DEFAULT_SAMPLE_INTERVAL_SECS),
            sensor_model: SensorModel::Dht11,
            qos: DeliveryLevel::AtLeastOnce,
            retain: false,
            reconnect_policy: RetryPolicy::Immediate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, MutexGuard};

    // Tests in this module share the process environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "DHT_AGENT_WIFI_SSID",
        "DHT_AGENT_WIFI_PASSWORD",
        "DHT_AGENT_BROKER_URI",
        "DHT_AGENT_BROKER_PORT",
        "DHT_AGENT_CLIENT_ID",
        "DHT_AGENT_TEMPERATURE_TOPIC",
        "DHT_AGENT_HUMIDITY_TOPIC",
        "DHT_AGENT_SAMPLE_INTERVAL_SECS",
        "DHT_AGENT_SENSOR_MODEL",
        "DHT_AGENT_QOS",
        "DHT_AGENT_RETAIN",
        "DHT_AGENT_RECONNECT_POLICY",
        "DHT_AGENT_RECONNECT_BASE_MS",
        "DHT_AGENT_RECONNECT_MAX_MS",
    ];

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    /// Lock the environment and clear every agent variable.
    ///
    /// Guards come first so variables are restored before the lock is released.
    fn clean_env() -> (Vec<EnvGuard>, MutexGuard<'static, ()>) {
        let lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let guards = ALL_VARS.iter().map(|var| EnvGuard::remove(var)).collect();
        (guards, lock)
    }

    fn expect_error(var: &str, value: &str, fragment: &str) {
        let _env = clean_env();
        let _guard = EnvGuard::set(var, value);

        let err = Config::from_env().expect_err("invalid value should be rejected");
        assert_eq!(err.env_var.as_deref(), Some(var));
        assert!(
            err.message.contains(fragment),
            "'{}' does not contain '{}'",
            err.message,
            fragment
        );
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.broker_uri, "mqtt://test.mosquitto.org");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.sample_interval, Duration::from_secs(120));
        assert_eq!(config.sensor_model, SensorModel::Dht11);
        assert_eq!(config.qos, DeliveryLevel::AtLeastOnce);
        assert!(!config.retain);
        assert_eq!(config.reconnect_policy, RetryPolicy::Immediate);
        assert!(config.client_id.starts_with("dht-agent-"));
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _env = clean_env();

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.wifi_ssid, "dht-agent");
        assert_eq!(config.wifi_password, "");
        assert_eq!(config.temperature_topic, "dht-agent/temperature");
        assert_eq!(config.humidity_topic, "dht-agent/humidity");
        assert_eq!(config.sample_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _env = clean_env();
        let _g1 = EnvGuard::set("DHT_AGENT_WIFI_SSID", "greenhouse");
        let _g2 = EnvGuard::set("DHT_AGENT_WIFI_PASSWORD", "s3cret");
        let _g3 = EnvGuard::set("DHT_AGENT_BROKER_URI", "mqtt://broker.local");
        let _g4 = EnvGuard::set("DHT_AGENT_BROKER_PORT", "8883");
        let _g5 = EnvGuard::set("DHT_AGENT_CLIENT_ID", "esp8266_client");
        let _g6 = EnvGuard::set("DHT_AGENT_TEMPERATURE_TOPIC", "lab/temperatura");
        let _g7 = EnvGuard::set("DHT_AGENT_HUMIDITY_TOPIC", "lab/umidade");
        let _g8 = EnvGuard::set("DHT_AGENT_SAMPLE_INTERVAL_SECS", "30");
        let _g9 = EnvGuard::set("DHT_AGENT_SENSOR_MODEL", "dht22");
        let _g10 = EnvGuard::set("DHT_AGENT_QOS", "0");
        let _g11 = EnvGuard::set("DHT_AGENT_RETAIN", "true");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.credentials(), Credentials::new("greenhouse", "s3cret"));
        assert_eq!(config.endpoint().to_string(), "mqtt://broker.local:8883");
        assert_eq!(config.client_id, "esp8266_client");
        assert_eq!(
            config.topics(),
            Topics::new("lab/temperatura", "lab/umidade")
        );

        let loop_config = config.loop_config();
        assert_eq!(loop_config.interval, Duration::from_secs(30));
        assert_eq!(loop_config.model, SensorModel::Dht22);
        assert_eq!(loop_config.level, DeliveryLevel::AtMostOnce);
        assert!(loop_config.retain);
    }

    #[test]
    fn test_backoff_policy_from_env() {
        let _env = clean_env();
        let _g1 = EnvGuard::set("DHT_AGENT_RECONNECT_POLICY", "backoff");
        let _g2 = EnvGuard::set("DHT_AGENT_RECONNECT_BASE_MS", "250");
        let _g3 = EnvGuard::set("DHT_AGENT_RECONNECT_MAX_MS", "10000");

        let config = Config::from_env().expect("Should load backoff policy");
        assert_eq!(
            config.reconnect_policy,
            RetryPolicy::Backoff {
                base: Duration::from_millis(250),
                max: Duration::from_secs(10),
            }
        );
    }

    #[test]
    fn test_backoff_max_below_base() {
        let _env = clean_env();
        let _g1 = EnvGuard::set("DHT_AGENT_RECONNECT_POLICY", "backoff");
        let _g2 = EnvGuard::set("DHT_AGENT_RECONNECT_BASE_MS", "5000");
        let _g3 = EnvGuard::set("DHT_AGENT_RECONNECT_MAX_MS", "1000");

        let err = Config::from_env().unwrap_err();
        assert!(err.message.contains("below the base"));
    }

    #[test]
    fn test_generated_client_ids_differ() {
        assert_ne!(generate_client_id(), generate_client_id());
    }

    #[test]
    fn test_invalid_values() {
        expect_error("DHT_AGENT_WIFI_SSID", "", "must not be empty");
        expect_error("DHT_AGENT_WIFI_SSID", &"x".repeat(33), "exceeds 32");
        expect_error("DHT_AGENT_WIFI_PASSWORD", &"x".repeat(65), "exceeds 64");
        expect_error("DHT_AGENT_BROKER_PORT", "0", "greater than 0");
        expect_error("DHT_AGENT_BROKER_PORT", "70000", "not a valid port");
        expect_error("DHT_AGENT_TEMPERATURE_TOPIC", "sensors/#", "wildcard");
        expect_error("DHT_AGENT_HUMIDITY_TOPIC", "   ", "must not be empty");
        expect_error("DHT_AGENT_SAMPLE_INTERVAL_SECS", "soon", "not a valid number");
        expect_error("DHT_AGENT_SAMPLE_INTERVAL_SECS", "0", "below minimum");
        expect_error("DHT_AGENT_SAMPLE_INTERVAL_SECS", "7200", "exceeds maximum");
        expect_error("DHT_AGENT_SENSOR_MODEL", "bme280", "unknown sensor model");
        expect_error("DHT_AGENT_QOS", "3", "QoS must be");
        expect_error("DHT_AGENT_RETAIN", "maybe", "not a valid boolean");
        expect_error("DHT_AGENT_RECONNECT_POLICY", "sometimes", "unknown reconnect policy");
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError {
            message: "test error".to_string(),
            env_var: Some("TEST_VAR".to_string()),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError {
            message: "general error".to_string(),
            env_var: None,
        };
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
