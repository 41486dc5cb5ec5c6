//! Bootstrap sequencer.
//!
//! Orders one-time initialization before the sampling loop starts:
//! 1. Persistent storage (erased and re-initialised once if its layout is unusable)
//! 2. Connectivity manager: event pump and reconnect task, then association
//! 3. Session manager: event pump, link follower, first start attempt
//! 4. Sampling loop task
//!
//! Only a storage failure is fatal. Everything after that degrades to
//! log-and-retry inside the managers.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::connectivity::{ConnectivityManager, LinkEvent, LinkStats, NetworkStack};
use crate::sampler::{LoopStats, SamplingLoop};
use crate::sensor::Sensor;
use crate::session::{BrokerTransport, SessionEvent, SessionManager, SessionStats};

/// Capacity of the link and session event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Errors reported by persistent storage initialisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The partition has no free pages left
    NoFreePages,

    /// The partition was written by a newer layout version
    NewVersionFound,

    /// Any other storage failure
    Io(String),
}

impl StorageError {
    /// Whether erasing the partition and retrying can fix this.
    pub fn is_recoverable_by_erase(&self) -> bool {
        matches!(self, StorageError::NoFreePages | StorageError::NewVersionFound)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NoFreePages => write!(f, "Storage has no free pages"),
            StorageError::NewVersionFound => write!(f, "Storage holds a newer layout version"),
            StorageError::Io(e) => write!(f, "Storage I/O error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

/// Persistent key-value storage the radio stack depends on.
pub trait PersistentStorage: Send {
    fn init(&mut self) -> Result<(), StorageError>;
    fn erase(&mut self) -> Result<(), StorageError>;
}

/// Fatal startup failures.
#[derive(Debug)]
pub enum BootstrapError {
    Storage(StorageError),
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::Storage(e) => write!(f, "Storage initialisation failed: {}", e),
        }
    }
}

impl std::error::Error for BootstrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BootstrapError::Storage(e) => Some(e),
        }
    }
}

impl From<StorageError> for BootstrapError {
    fn from(err: StorageError) -> Self {
        BootstrapError::Storage(err)
    }
}

/// External capabilities the agent is wired to.
pub struct Collaborators<St, Se> {
    pub storage: St,
    pub network: Arc<dyn NetworkStack>,
    pub link_events: mpsc::Receiver<LinkEvent>,
    pub transport: Arc<dyn BrokerTransport>,
    pub session_events: mpsc::Receiver<SessionEvent>,
    pub sensor: Se,
}

/// Running agent: managers, loop statistics and background tasks.
pub struct AgentHandle {
    link: Arc<ConnectivityManager>,
    session: Arc<SessionManager>,
    loop_stats: Arc<RwLock<LoopStats>>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    pub fn link(&self) -> &Arc<ConnectivityManager> {
        &self.link
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn loop_stats(&self) -> LoopStats {
        self.loop_stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn link_stats(&self) -> LinkStats {
        self.link.stats()
    }

    pub fn session_stats(&self) -> SessionStats {
        self.session.stats()
    }

    /// Stop every background task.
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        info!(tasks = self.tasks.len(), "Agent tasks stopped");
    }
}

/// Initialise storage, erasing it once if its contents cannot be used.
pub fn init_storage(storage: &mut impl PersistentStorage) -> Result<(), StorageError> {
    match storage.init() {
        Ok(()) => Ok(()),
        Err(e) if e.is_recoverable_by_erase() => {
            warn!(error = %e, "Storage unusable, erasing and re-initialising");
            storage.erase()?;
            storage.init()
        }
        Err(e) => Err(e),
    }
}

/// Bring the agent up in order and return once the sampling loop is running.
pub async fn bootstrap<St, Se>(
    config: &Config,
    collaborators: Collaborators<St, Se>,
) -> Result<AgentHandle, BootstrapError>
where
    St: PersistentStorage,
    Se: Sensor + 'static,
{
    let Collaborators {
        mut storage,
        network,
        link_events,
        transport,
        session_events,
        sensor,
    } = collaborators;

    init_storage(&mut storage)?;
    info!("Persistent storage ready");

    let mut tasks = Vec::with_capacity(5);

    let link = Arc::new(ConnectivityManager::new(network, config.reconnect_policy));
    tasks.push(tokio::spawn(link.clone().run_events(link_events)));
    tasks.push(tokio::spawn(link.clone().run_reconnect()));
    link.start(config.credentials());
    info!(policy = link.policy().name(), "Connectivity manager started");

    let session = SessionManager::new(
        link.clone(),
        transport,
        config.endpoint(),
        config.client_id.clone(),
    );
    tasks.push(tokio::spawn(session.clone().run_events(session_events)));
    tasks.push(tokio::spawn(session.clone().follow_link()));
    session.start();
    info!(broker = %session.endpoint(), "Session manager started");

    let sampler = SamplingLoop::new(sensor, session.clone(), config.loop_config());
    let loop_stats = sampler.stats_handle();
    tasks.push(tokio::spawn(sampler.run()));
    info!("Sampling loop spawned");

    Ok(AgentHandle {
        link,
        session,
        loop_stats,
        tasks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::LinkState;
    use crate::sensor::RawReading;
    use crate::session::SessionState;
    use crate::testing::{ManualNetwork, RecordingTransport, ScriptedSensor};
    use std::time::Duration;

    struct FlakyStorage {
        init_results: Vec<Result<(), StorageError>>,
        erased: usize,
    }

    impl PersistentStorage for FlakyStorage {
        fn init(&mut self) -> Result<(), StorageError> {
            if self.init_results.is_empty() {
                Ok(())
            } else {
                self.init_results.remove(0)
            }
        }

        fn erase(&mut self) -> Result<(), StorageError> {
            self.erased += 1;
            Ok(())
        }
    }

    #[test]
    fn test_init_storage_erases_on_new_version() {
        let mut storage = FlakyStorage {
            init_results: vec![Err(StorageError::NewVersionFound), Ok(())],
            erased: 0,
        };
        assert!(init_storage(&mut storage).is_ok());
        assert_eq!(storage.erased, 1);
    }

    #[test]
    fn test_init_storage_propagates_io_error() {
        let mut storage = FlakyStorage {
            init_results: vec![Err(StorageError::Io("flash locked".into()))],
            erased: 0,
        };
        assert_eq!(
            init_storage(&mut storage),
            Err(StorageError::Io("flash locked".into()))
        );
        assert_eq!(storage.erased, 0);
    }

    #[test]
    fn test_init_storage_fails_if_erase_does_not_help() {
        let mut storage = FlakyStorage {
            init_results: vec![Err(StorageError::NoFreePages), Err(StorageError::NoFreePages)],
            erased: 0,
        };
        assert_eq!(init_storage(&mut storage), Err(StorageError::NoFreePages));
    }

    #[tokio::test]
    async fn test_bootstrap_fails_on_storage_error() {
        let (_link_tx, link_events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (_session_tx, session_events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let network = Arc::new(ManualNetwork::new());

        let collaborators = Collaborators {
            storage: FlakyStorage {
                init_results: vec![Err(StorageError::Io("bad partition".into()))],
                erased: 0,
            },
            network: network.clone(),
            link_events,
            transport: Arc::new(RecordingTransport::new()),
            session_events,
            sensor: ScriptedSensor::new(vec![]),
        };

        let result = bootstrap(&Config::default(), collaborators).await;
        assert!(matches!(result, Err(BootstrapError::Storage(_))));
        assert_eq!(network.associate_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_samples_while_association_keeps_failing() {
        let (link_tx, link_events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (_session_tx, session_events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let network = Arc::new(ManualNetwork::new());
        network.fail_next(usize::MAX);

        let sensor = ScriptedSensor::new(vec![Ok(RawReading {
            humidity: 500,
            temperature: -15,
        })]);
        let reads = sensor.reads();
        let collaborators = Collaborators {
            storage: FlakyStorage {
                init_results: vec![],
                erased: 0,
            },
            network: network.clone(),
            link_events,
            transport: Arc::new(RecordingTransport::new()),
            session_events,
            sensor,
        };

        let agent = tokio::time::timeout(
            Duration::from_millis(300),
            bootstrap(&Config::default(), collaborators),
        )
        .await
        .expect("bootstrap returns while the stack rejects association")
        .expect("bootstrap");

        // Three sampling intervals with the link never coming up.
        tokio::time::sleep(Config::default().sample_interval * 3).await;

        let stats = agent.loop_stats();
        assert!(stats.cycles >= 3);
        assert_eq!(reads.load(std::sync::atomic::Ordering::SeqCst) as u64, stats.cycles);
        assert_eq!(stats.records_published, 0);
        assert_eq!(stats.records_dropped, stats.cycles * 2);
        assert!(network.associate_calls() > 3);
        assert_eq!(agent.link().current_state(), LinkState::Disconnected);

        // The link event pump still answers.
        link_tx.send(LinkEvent::Connected).await.unwrap();
        for _ in 0..50 {
            if agent.link().current_state() == LinkState::Connected {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(agent.link().current_state(), LinkState::Connected);

        agent.shutdown();
    }

    #[tokio::test]
    async fn test_bootstrap_wires_event_flow() {
        let (link_tx, link_events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (session_tx, session_events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let network = Arc::new(ManualNetwork::new());
        let transport = Arc::new(RecordingTransport::new());

        let config = Config {
            sample_interval: Duration::from_secs(3_600),
            ..Config::default()
        };
        let collaborators = Collaborators {
            storage: FlakyStorage {
                init_results: vec![],
                erased: 0,
            },
            network: network.clone(),
            link_events,
            transport: transport.clone(),
            session_events,
            sensor: ScriptedSensor::new(vec![Ok(RawReading {
                humidity: 500,
                temperature: 215,
            })]),
        };

        let agent = bootstrap(&config, collaborators).await.expect("bootstrap");
        assert_eq!(network.associate_calls(), 1);
        assert_eq!(agent.link().current_state(), LinkState::Connecting);

        link_tx.send(LinkEvent::Connected).await.unwrap();
        for _ in 0..100 {
            if transport.open_calls() > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.open_calls(), 1);
        assert_eq!(transport.last_client_id(), Some(config.client_id.clone()));

        session_tx.send(SessionEvent::Connected).await.unwrap();
        for _ in 0..100 {
            if agent.session().current_state() == SessionState::Open {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(agent.session().current_state(), SessionState::Open);

        for _ in 0..100 {
            if agent.loop_stats().cycles > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }

        // One cycle at startup, both records attempted; the next is an hour away.
        let stats = agent.loop_stats();
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.records_published + stats.records_dropped, 2);

        agent.shutdown();
    }
}
