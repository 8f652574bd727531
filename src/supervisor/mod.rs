//! Broker connection supervision.
//!
//! The supervisor is the only writer of the current connection. Everything
//! else holds a [`ConnectionHandle`] and fetches the connection at time of
//! use, since a reconnect replaces it wholesale.
//!
//! ## Recovery
//! ```text
//! [close notification] -> clear current -> connect (bounded retry)
//!        ^                                     |
//!        |                                     v
//!   subscribe <- install new <- ensure topology
//! ```
//! Consumers wake up when the new connection is installed, which only
//! happens after topology has been re-declared on it.

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerConnection, BrokerError};
use crate::topology::{ensure_topology, Topology, TopologyError};
use crate::utils::retry::connect_backoff;
use crate::utils::shutdown::ShutdownSignal;

/// Errors surfaced by the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Broker unreachable after {attempts} attempts: {source}")]
    Unreachable { attempts: usize, source: BrokerError },

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

impl SupervisorError {
    /// Whether the recovery loop must give up instead of dialing again.
    pub fn is_fatal(&self) -> bool {
        match self {
            SupervisorError::Unreachable { .. } => false,
            SupervisorError::Topology(e) => e.is_fatal(),
        }
    }
}

/// Dial policy.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Pause between dial attempts.
    pub retry_delay: Duration,
    /// Dial attempts per `connect` call before giving up.
    pub max_attempts: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            max_attempts: 30,
        }
    }
}

type Slot = Option<Arc<dyn BrokerConnection>>;

/// Read side of the current connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    current: watch::Receiver<Slot>,
}

impl ConnectionHandle {
    /// The current connection, if one is installed and still open.
    pub fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.current
            .borrow()
            .as_ref()
            .filter(|conn| conn.is_open())
            .cloned()
    }

    /// Like [`current`](Self::current), and marks the value as seen so
    /// [`wait_for_new`](Self::wait_for_new) only wakes for a later install.
    pub fn acquire(&mut self) -> Option<Arc<dyn BrokerConnection>> {
        self.current
            .borrow_and_update()
            .as_ref()
            .filter(|conn| conn.is_open())
            .cloned()
    }

    /// Wait up to `timeout` for the supervisor to install another connection.
    ///
    /// Once the supervisor is gone nothing can be installed, so this just
    /// sleeps out the timeout.
    pub async fn wait_for_new(&mut self, timeout: Duration) {
        if let Ok(Err(_)) = tokio::time::timeout(timeout, self.current.changed()).await {
            tokio::time::sleep(timeout).await;
        }
    }
}

/// Owns the authoritative broker connection.
pub struct ConnectionSupervisor {
    broker: Arc<dyn Broker>,
    topology: Arc<Topology>,
    config: SupervisorConfig,
    current: watch::Sender<Slot>,
}

impl ConnectionSupervisor {
    pub fn new(broker: Arc<dyn Broker>, topology: Arc<Topology>, config: SupervisorConfig) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            broker,
            topology,
            config,
            current,
        }
    }

    /// A reader of the current connection.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            current: self.current.subscribe(),
        }
    }

    /// Dial the broker, retrying at a fixed interval up to `max_attempts` times.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, SupervisorError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = connect_backoff(self.config.retry_delay, max_attempts).build();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.broker.connect().await {
                Ok(conn) => {
                    info!(
                        broker = %self.broker.endpoint(),
                        attempt = attempt,
                        "Connected to broker"
                    );
                    return Ok(conn);
                }
                Err(e) => match backoff.next() {
                    Some(delay) => {
                        warn!(
                            broker = %self.broker.endpoint(),
                            attempt = attempt,
                            max_attempts = max_attempts,
                            error = %e,
                            "Broker not yet ready, retrying in {:?}",
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(
                            broker = %self.broker.endpoint(),
                            attempts = attempt,
                            error = %e,
                            "Giving up on broker"
                        );
                        return Err(SupervisorError::Unreachable {
                            attempts: attempt,
                            source: e,
                        });
                    }
                },
            }
        }
    }

    /// Startup: connect, declare topology, install the connection.
    ///
    /// Any failure here is fatal to the process.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let conn = self.establish().await?;
        self.install(conn);
        Ok(())
    }

    /// Watch the current connection and rebuild it whenever it closes.
    ///
    /// Returns `Ok` on shutdown and `Err` only for fatal topology errors.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<(), SupervisorError> {
        loop {
            let current = self.current.borrow().clone();
            if let Some(conn) = current {
                tokio::select! {
                    _ = conn.closed() => {}
                    _ = shutdown.cancelled() => return Ok(()),
                }
                warn!("Broker connection lost, recovering");
            }

            // Publishers fail fast until the new connection is ready.
            self.current.send_replace(None);

            loop {
                let recovered = tokio::select! {
                    result = self.establish() => result,
                    _ = shutdown.cancelled() => return Ok(()),
                };

                match recovered {
                    Ok(conn) => {
                        self.install(conn);
                        info!("Broker connection recovered");
                        break;
                    }
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "Unrecoverable broker configuration error");
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(error = %e, "Recovery attempt failed, dialing again");
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.retry_delay) => {}
                            _ = shutdown.cancelled() => return Ok(()),
                        }
                    }
                }
            }
        }
    }

    /// Close the current connection (process shutdown).
    pub async fn close(&self) {
        if let Some(conn) = self.current.send_replace(None) {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "Failed to close broker connection");
            }
        }
    }

    async fn establish(&self) -> Result<Arc<dyn BrokerConnection>, SupervisorError> {
        let conn = self.connect().await?;
        if let Err(e) = ensure_topology(conn.as_ref(), &self.topology).await {
            let _ = conn.close().await;
            return Err(e.into());
        }
        Ok(conn)
    }

    fn install(&self, conn: Arc<dyn BrokerConnection>) {
        self.current.send_replace(Some(conn));
    }
}
