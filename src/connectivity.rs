//! Connectivity manager for the device's network link.
//!
//! This module owns the [`LinkState`] and keeps the link alive: every loss
//! reported by the network stack triggers a new association attempt with the
//! last-used credentials, paced by the injected [`RetryPolicy`]. Delayed
//! attempts run on [`ConnectivityManager::run_reconnect`], so neither callers
//! nor the event pump ever wait on the network.
//!
//! Other components learn about link transitions in two ways:
//! - [`LinkObserver`]s are called synchronously, while the state lock is held,
//!   so they can keep dependent state consistent with the link
//! - [`ConnectivityManager::watch`] hands out a tokio watch receiver for
//!   anything that needs to react asynchronously

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::lock;
use crate::retry::RetryPolicy;

/// Minimum wait before retrying an association request the stack rejected.
pub const REJECTED_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Association state of the network link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}

/// Notifications delivered by the network stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Association completed and an address was obtained
    Connected,

    /// The access point dropped us or association did not complete
    Disconnected,

    /// Stack-level failure, handled the same way as a disconnect
    Error(String),
}

/// Network identity and secret used to associate.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl Credentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Errors reported by the network stack when asked to associate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The stack refused to start association
    Association(String),

    /// The radio is not initialised
    NotReady,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Association(e) => write!(f, "Association request failed: {}", e),
            LinkError::NotReady => write!(f, "Network stack not ready"),
        }
    }
}

impl std::error::Error for LinkError {}

/// Association capability of the underlying network stack.
///
/// `associate` only requests association and returns immediately; the outcome
/// arrives later as a [`LinkEvent`].
pub trait NetworkStack: Send + Sync {
    fn associate(&self, credentials: &Credentials) -> Result<(), LinkError>;
}

/// Synchronous listener for link transitions.
///
/// Called with the link state lock held. Implementations must not call back
/// into the [`ConnectivityManager`].
pub trait LinkObserver: Send + Sync {
    fn on_link_state(&self, state: LinkState);
}

/// Counters describing reconnection activity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkStats {
    /// Number of times the link was lost while connected or connecting
    pub losses: u64,

    /// Association requests rejected synchronously by the stack
    pub association_failures: u64,
}

/// Establishes and maintains the network link.
pub struct ConnectivityManager {
    network: Arc<dyn NetworkStack>,
    policy: RetryPolicy,
    state: Mutex<LinkState>,
    credentials: Mutex<Option<Credentials>>,
    observers: Mutex<Vec<Weak<dyn LinkObserver>>>,
    changes: watch::Sender<LinkState>,
    // Consecutive failures since the last successful association
    failures: AtomicU32,
    pending_retry: Mutex<Option<Duration>>,
    retry: Notify,
    losses: AtomicU64,
    association_failures: AtomicU64,
}

impl ConnectivityManager {
    /// Create a manager in the `Disconnected` state.
    pub fn new(network: Arc<dyn NetworkStack>, policy: RetryPolicy) -> Self {
        let (changes, _) = watch::channel(LinkState::Disconnected);

        Self {
            network,
            policy,
            state: Mutex::new(LinkState::Disconnected),
            credentials: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
            changes,
            failures: AtomicU32::new(0),
            pending_retry: Mutex::new(None),
            retry: Notify::new(),
            losses: AtomicU64::new(0),
            association_failures: AtomicU64::new(0),
        }
    }

    /// Begin associating with the given credentials.
    ///
    /// No-op if the link is already connecting or connected. Makes a single
    /// association request and returns; association completes asynchronously.
    /// A request the stack rejects puts the link back to `Disconnected` and
    /// schedules another attempt on the reconnect task.
    pub fn start(&self, credentials: Credentials) {
        {
            let mut state = lock(&self.state);
            if *state != LinkState::Disconnected {
                debug!(state = %*state, "Link start ignored, already active");
                return;
            }
            *lock(&self.credentials) = Some(credentials.clone());
            self.transition(&mut state, LinkState::Connecting);
        }

        info!(ssid = %credentials.ssid, "Associating with access point");

        match self.network.associate(&credentials) {
            Ok(()) => debug!(ssid = %credentials.ssid, "Association requested"),
            Err(e) => {
                {
                    let mut state = lock(&self.state);
                    if *state != LinkState::Connecting {
                        return;
                    }
                    self.transition(&mut state, LinkState::Disconnected);
                }

                self.association_failures.fetch_add(1, Ordering::Relaxed);
                let attempt = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                let delay = self.policy.delay_for(attempt).max(REJECTED_RETRY_DELAY);
                warn!(
                    error = %e,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Association request rejected, retry scheduled"
                );
                self.schedule_retry(delay);
            }
        }
    }

    /// Handle a notification from the network stack.
    ///
    /// A disconnect or error while connected or connecting moves the link to
    /// `Disconnected` and reassociates with the last-used credentials. With a
    /// zero policy delay that happens before returning, otherwise the
    /// reconnect task picks it up. Attempts are unbounded.
    pub fn on_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                let mut state = lock(&self.state);
                self.failures.store(0, Ordering::Relaxed);
                if *state != LinkState::Connected {
                    self.transition(&mut state, LinkState::Connected);
                    info!("Connected to access point");
                }
            }
            LinkEvent::Disconnected | LinkEvent::Error(_) => {
                let lost = {
                    let mut state = lock(&self.state);
                    match *state {
                        LinkState::Connected | LinkState::Connecting => {
                            self.transition(&mut state, LinkState::Disconnected);
                            true
                        }
                        LinkState::Disconnected => false,
                    }
                };

                if !lost {
                    debug!(event = ?event, "Link event ignored while disconnected");
                    return;
                }

                self.losses.fetch_add(1, Ordering::Relaxed);
                let attempt = self.failures.fetch_add(1, Ordering::Relaxed) + 1;

                match &event {
                    LinkEvent::Error(e) => {
                        warn!(error = %e, attempt = attempt, "Link error, reconnecting")
                    }
                    _ => warn!(attempt = attempt, "Disconnected from access point, reconnecting"),
                }

                let delay = self.policy.delay_for(attempt);
                if delay.is_zero() {
                    self.reconnect();
                } else {
                    debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
                    self.schedule_retry(delay);
                }
            }
        }
    }

    /// Current link state. Never blocks on the network.
    pub fn current_state(&self) -> LinkState {
        *lock(&self.state)
    }

    /// Run `f` against the current state while holding the state lock.
    ///
    /// No transition can happen until `f` returns. `f` must not call back into
    /// this manager.
    pub fn with_state<R>(&self, f: impl FnOnce(LinkState) -> R) -> R {
        let state = lock(&self.state);
        f(*state)
    }

    /// Register a synchronous observer. It is immediately told the current state.
    ///
    /// Only a weak reference is kept; dropped observers are pruned on the next
    /// transition.
    pub fn subscribe<O: LinkObserver + 'static>(&self, observer: &Arc<O>) {
        let state = lock(&self.state);
        let weak: Weak<dyn LinkObserver> = Arc::downgrade(observer) as Weak<dyn LinkObserver>;
        observer.on_link_state(*state);
        lock(&self.observers).push(weak);
    }

    /// Receiver that is notified on every transition.
    pub fn watch(&self) -> watch::Receiver<LinkState> {
        self.changes.subscribe()
    }

    /// Retry policy in use.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            losses: self.losses.load(Ordering::Relaxed),
            association_failures: self.association_failures.load(Ordering::Relaxed),
        }
    }

    /// Consume link events until the channel closes.
    pub async fn run_events(self: Arc<Self>, mut events: mpsc::Receiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            self.on_link_event(event);
        }
        info!("Link event channel closed");
    }

    /// Carry out delayed association attempts.
    ///
    /// Runs for the life of the agent. Only one attempt is pending at a time;
    /// a newer schedule replaces an older one.
    pub async fn run_reconnect(self: Arc<Self>) {
        loop {
            self.retry.notified().await;

            let Some(delay) = lock(&self.pending_retry).take() else {
                continue;
            };
            tokio::time::sleep(delay).await;
            self.reconnect();
        }
    }

    fn transition(&self, state: &mut MutexGuard<'_, LinkState>, next: LinkState) {
        let previous = **state;
        **state = next;
        debug!(from = %previous, to = %next, "Link state changed");

        let mut observers = lock(&self.observers);
        observers.retain(|weak| match weak.upgrade() {
            Some(observer) => {
                observer.on_link_state(next);
                true
            }
            None => false,
        });
        drop(observers);

        self.changes.send_replace(next);
    }

    fn schedule_retry(&self, delay: Duration) {
        *lock(&self.pending_retry) = Some(delay);
        self.retry.notify_one();
    }

    fn reconnect(&self) {
        let credentials = lock(&self.credentials).clone();
        match credentials {
            Some(credentials) => self.start(credentials),
            None => warn!("No credentials recorded, cannot reconnect"),
        }
    }
}
