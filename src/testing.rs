//! Test doubles for the external collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::connectivity::{ConnectivityManager, Credentials, LinkError, LinkEvent, NetworkStack};
use crate::sensor::{RawReading, Sensor, SensorModel, SensorReadError};
use crate::session::{
    BrokerEndpoint, BrokerTransport, DeliveryLevel, SessionError, SessionEvent, SessionManager,
};

/// Network stack that records association requests.
pub struct ManualNetwork {
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    last_ssid: Mutex<Option<String>>,
}

impl ManualNetwork {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            last_ssid: Mutex::new(None),
        }
    }

    /// Reject the next `n` association requests.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn associate_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_ssid(&self) -> Option<String> {
        self.last_ssid.lock().unwrap().clone()
    }
}

impl NetworkStack for ManualNetwork {
    fn associate(&self, credentials: &Credentials) -> Result<(), LinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_ssid.lock().unwrap() = Some(credentials.ssid.clone());

        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(LinkError::Association("radio busy".to_string()));
        }
        Ok(())
    }
}

/// A message handed to [`RecordingTransport`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub topic: String,
    pub payload: String,
    pub level: DeliveryLevel,
    pub retain: bool,
}

/// Broker transport that records what it was asked to do.
pub struct RecordingTransport {
    open_calls: AtomicUsize,
    last_client_id: Mutex<Option<String>>,
    fail_open: AtomicBool,
    fail_publish: AtomicBool,
    published: Mutex<Vec<SentMessage>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            open_calls: AtomicUsize::new(0),
            last_client_id: Mutex::new(None),
            fail_open: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn last_client_id(&self) -> Option<String> {
        self.last_client_id.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<SentMessage> {
        self.published.lock().unwrap().clone()
    }
}

impl BrokerTransport for RecordingTransport {
    fn open_session(&self, _endpoint: &BrokerEndpoint, client_id: &str) -> Result<(), SessionError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_client_id.lock().unwrap() = Some(client_id.to_string());
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(SessionError::Open("connection refused".to_string()));
        }
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: &str,
        level: DeliveryLevel,
        retain: bool,
    ) -> Result<(), SessionError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(SessionError::Rejected("outbox full".to_string()));
        }
        self.published.lock().unwrap().push(SentMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
            level,
            retain,
        });
        Ok(())
    }
}

/// Sensor that replays a fixed script, then repeats the last entry.
pub struct ScriptedSensor {
    script: VecDeque<Result<RawReading, SensorReadError>>,
    last: Result<RawReading, SensorReadError>,
    reads: Arc<AtomicUsize>,
}

impl ScriptedSensor {
    pub fn new(script: Vec<Result<RawReading, SensorReadError>>) -> Self {
        Self {
            script: script.into(),
            last: Err(SensorReadError::NoResponse),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter of completed reads.
    pub fn reads(&self) -> Arc<AtomicUsize> {
        self.reads.clone()
    }
}

impl Sensor for ScriptedSensor {
    async fn read(&mut self, _model: SensorModel) -> Result<RawReading, SensorReadError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.script.pop_front() {
            self.last = next;
        }
        self.last.clone()
    }
}

/// Drive link and session to `Open` through the normal event path.
pub fn open_session(link: &Arc<ConnectivityManager>, session: &Arc<SessionManager>) {
    link.start(Credentials::new("test-ap", "secret"));
    link.on_link_event(LinkEvent::Connected);
    session.start();
    session.on_session_event(SessionEvent::Connected);
}
