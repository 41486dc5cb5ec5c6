//! Session manager for the broker connection.
//!
//! The session sits on top of the network link. It may only be opened while the
//! link is `Connected`, and any link loss forces it back to `Closed` in the same
//! critical section as the link transition, so `Open` is never observable while
//! the link is down.
//!
//! A session that faults or closes while the link stays up is reopened by
//! [`SessionManager::follow_link`], paced by the link's retry policy but never
//! sooner than [`MIN_REOPEN_DELAY`].
//!
//! Publishing is best effort: when the session is not open the record is
//! dropped and the caller gets [`PublishError::NotOpen`]. Nothing is queued.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::connectivity::{ConnectivityManager, LinkObserver, LinkState};
use crate::lock;
use crate::measurement::PublishRecord;

/// Minimum wait before reopening a session that faulted or was closed by the broker.
pub const MIN_REOPEN_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Closed => write!(f, "closed"),
            SessionState::Opening => write!(f, "opening"),
            SessionState::Open => write!(f, "open"),
            SessionState::Faulted => write!(f, "faulted"),
        }
    }
}

/// Notifications delivered by the broker transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Error(i32),
}

/// MQTT delivery guarantee for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeliveryLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl DeliveryLevel {
    /// Numeric QoS value used on the wire.
    pub fn qos(&self) -> u8 {
        match self {
            DeliveryLevel::AtMostOnce => 0,
            DeliveryLevel::AtLeastOnce => 1,
            DeliveryLevel::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for DeliveryLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DeliveryLevel::AtMostOnce),
            1 => Ok(DeliveryLevel::AtLeastOnce),
            2 => Ok(DeliveryLevel::ExactlyOnce),
            other => Err(format!("QoS must be 0, 1 or 2 (got {})", other)),
        }
    }
}

/// Broker address the session connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub uri: String,
    pub port: u16,
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uri, self.port)
    }
}

/// Errors reported by the broker transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The transport could not start a session
    Open(String),

    /// The transport refused an outbound message
    Rejected(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Open(e) => write!(f, "Failed to open broker session: {}", e),
            SessionError::Rejected(e) => write!(f, "Transport rejected message: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

/// Why a publish did not go out.
///
/// Both variants mean "drop this reading"; neither is fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The session was not open when the publish was attempted
    NotOpen,

    /// The session was open but the transport refused the message
    Transport(SessionError),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NotOpen => write!(f, "Broker session is not open"),
            PublishError::Transport(e) => write!(f, "Publish failed: {}", e),
        }
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PublishError::Transport(e) => Some(e),
            PublishError::NotOpen => None,
        }
    }
}

impl From<SessionError> for PublishError {
    fn from(err: SessionError) -> Self {
        PublishError::Transport(err)
    }
}

/// Broker client capability.
///
/// Framing, keep-alive and QoS handshakes are the transport's business. Both
/// calls return without waiting on the network; session outcomes arrive as
/// [`SessionEvent`]s.
pub trait BrokerTransport: Send + Sync {
    fn open_session(&self, endpoint: &BrokerEndpoint, client_id: &str) -> Result<(), SessionError>;

    fn publish(
        &self,
        topic: &str,
        payload: &str,
        level: DeliveryLevel,
        retain: bool,
    ) -> Result<(), SessionError>;
}

/// Statistics about publish attempts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    /// Records handed to the transport
    pub published: u64,

    /// Records dropped because the session was not open
    pub dropped_not_open: u64,

    /// Records the transport refused
    pub transport_failures: u64,
}

/// Establishes and maintains the broker session.
pub struct SessionManager {
    link: Arc<ConnectivityManager>,
    transport: Arc<dyn BrokerTransport>,
    endpoint: BrokerEndpoint,
    client_id: String,
    state: Mutex<SessionState>,
    // Consecutive session failures since the broker last accepted us
    failures: AtomicU32,
    reopen: Notify,
    published: AtomicU64,
    dropped_not_open: AtomicU64,
    transport_failures: AtomicU64,
}

impl SessionManager {
    /// Create a session manager and register it as an observer of the link.
    pub fn new(
        link: Arc<ConnectivityManager>,
        transport: Arc<dyn BrokerTransport>,
        endpoint: BrokerEndpoint,
        client_id: impl Into<String>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            link: link.clone(),
            transport,
            endpoint,
            client_id: client_id.into(),
            state: Mutex::new(SessionState::Closed),
            failures: AtomicU32::new(0),
            reopen: Notify::new(),
            published: AtomicU64::new(0),
            dropped_not_open: AtomicU64::new(0),
            transport_failures: AtomicU64::new(0),
        });

        link.subscribe(&session);
        session
    }

    /// Begin establishing the session.
    ///
    /// Does nothing unless the link is `Connected`. Idempotent while opening or
    /// open. A faulted session is reset to `Closed` before the new attempt.
    pub fn start(&self) {
        let proceed = self.link.with_state(|link| {
            let mut state = lock(&self.state);

            if link != LinkState::Connected {
                debug!(link = %link, "Link not connected, session start deferred");
                return false;
            }

            match *state {
                SessionState::Opening | SessionState::Open => {
                    debug!(state = %*state, "Session start ignored, already active");
                    return false;
                }
                SessionState::Faulted => {
                    debug!("Clearing faulted session before reconnect");
                    *state = SessionState::Closed;
                }
                SessionState::Closed => {}
            }

            *state = SessionState::Opening;
            true
        });

        if !proceed {
            return;
        }

        info!(
            broker = %self.endpoint,
            client_id = %self.client_id,
            "Opening broker session"
        );

        if let Err(e) = self.transport.open_session(&self.endpoint, &self.client_id) {
            error!(error = %e, broker = %self.endpoint, "Broker session could not be opened");
            let faulted = {
                let mut state = lock(&self.state);
                let opening = *state == SessionState::Opening;
                if opening {
                    *state = SessionState::Faulted;
                }
                opening
            };
            if faulted {
                self.schedule_reopen();
            }
        }
    }

    /// Handle a notification from the broker transport.
    pub fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                self.link.with_state(|link| {
                    let mut state = lock(&self.state);
                    if link == LinkState::Connected {
                        *state = SessionState::Open;
                        self.failures.store(0, Ordering::Relaxed);
                        info!(broker = %self.endpoint, "Connected to broker");
                    } else {
                        *state = SessionState::Closed;
                        warn!(link = %link, "Broker reported connected while link is down, keeping session closed");
                    }
                });
            }
            SessionEvent::Disconnected => {
                *lock(&self.state) = SessionState::Closed;
                info!(broker = %self.endpoint, "Disconnected from broker");
                self.schedule_reopen();
            }
            SessionEvent::Error(code) => {
                *lock(&self.state) = SessionState::Faulted;
                error!(code = code, broker = %self.endpoint, "Broker session error");
                self.schedule_reopen();
            }
        }
    }

    /// Submit one message for delivery.
    ///
    /// # Errors
    ///
    /// - `PublishError::NotOpen` if the session is not open; the message is lost
    /// - `PublishError::Transport` if the transport refuses it
    pub fn publish(
        &self,
        topic: &str,
        payload: &str,
        level: DeliveryLevel,
        retain: bool,
    ) -> Result<(), PublishError> {
        if self.current_state() != SessionState::Open {
            self.dropped_not_open.fetch_add(1, Ordering::Relaxed);
            return Err(PublishError::NotOpen);
        }

        match self.transport.publish(topic, payload, level, retain) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!(topic = %topic, payload = %payload, qos = level.qos(), "Published");
                Ok(())
            }
            Err(e) => {
                self.transport_failures.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Publish a formatted record.
    pub fn publish_record(
        &self,
        record: &PublishRecord,
        level: DeliveryLevel,
        retain: bool,
    ) -> Result<(), PublishError> {
        self.publish(&record.topic, &record.payload, level, retain)
    }

    pub fn current_state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            published: self.published.load(Ordering::Relaxed),
            dropped_not_open: self.dropped_not_open.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
        }
    }

    /// Keep the session open whenever the link permits it.
    ///
    /// Re-attempts `start` every time the link becomes `Connected`, and after a
    /// fault or broker disconnect while the link stays up. Runs until the
    /// connectivity manager is dropped.
    pub async fn follow_link(self: Arc<Self>) {
        let mut changes = self.link.watch();

        loop {
            let link = *changes.borrow_and_update();
            if link == LinkState::Connected {
                self.start();
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.reopen.notified() => {
                    let attempt = self.failures.load(Ordering::Relaxed);
                    let delay = self.link.policy().delay_for(attempt).max(MIN_REOPEN_DELAY);
                    debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Reopening broker session");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        debug!("Link watch closed, no longer following link state");
    }

    /// Consume session events until the channel closes.
    pub async fn run_events(self: Arc<Self>, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.on_session_event(event);
        }
        info!("Session event channel closed");
    }

    fn schedule_reopen(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.reopen.notify_one();
    }
}

impl LinkObserver for SessionManager {
    fn on_link_state(&self, link: LinkState) {
        if link == LinkState::Connected {
            return;
        }

        let mut state = lock(&self.state);
        if *state != SessionState::Closed {
            info!(link = %link, session = %*state, "Link lost, closing broker session");
            *state = SessionState::Closed;
        }
    }
}
