//! Connection Manager: establishes the broker link a side owns.
//!
//! A [`Connection`] is immutable once built. Owners keep it behind an
//! `ArcSwap` and replace it wholesale after a reconnect, so a concurrent
//! publisher only ever sees a complete link. The manager never heals a
//! lost link on its own; the owner calls [`ConnectionManager::connect`]
//! again when its [`Inbound`] stream ends.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relay_core::{Envelope, RpcError, TransportError};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::ConnectConfig;
use crate::transport::{Broker, BrokerLink, Delivery, Link};

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One established broker link plus the receive address it declared.
pub struct Connection {
    address: String,
    generation: u64,
    link: Arc<dyn Link>,
}

impl Connection {
    /// Receive address owned by this side.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Increments on every successful connect of the same manager.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Publishes an envelope to its destination.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the link rejects the publish.
    pub async fn publish(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.link.publish(envelope).await
    }

    /// Closes the underlying link.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the broker fails to close cleanly.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.link.close().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Inbound message sequence of a connection. Ends when the link is lost.
#[derive(Debug)]
pub struct Inbound {
    deliveries: mpsc::Receiver<Delivery>,
}

impl Inbound {
    /// Waits for the next message; `None` once the link is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Opens links on one receive address with bounded retries.
#[derive(Clone)]
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    address: String,
    config: ConnectConfig,
    generation: Arc<AtomicU64>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, address: impl Into<String>, config: ConnectConfig) -> Self {
        Self {
            broker,
            address: address.into(),
            config,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Establishes a link, retrying up to `attempts` times with `wait`
    /// between attempts.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Connection` with the last transport error once
    /// every attempt has failed.
    pub async fn connect(&self) -> Result<(Arc<Connection>, Inbound), RpcError> {
        let attempts = self.config.attempts.max(1);
        let mut last_error = TransportError::Unreachable("no attempt made".to_string());

        for attempt in 1..=attempts {
            match self.broker.open(&self.address).await {
                Ok(BrokerLink { link, deliveries }) => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    info!(
                        address = %self.address,
                        attempt,
                        generation,
                        "broker link established"
                    );
                    let connection = Arc::new(Connection {
                        address: self.address.clone(),
                        generation,
                        link,
                    });
                    return Ok((connection, Inbound { deliveries }));
                }
                Err(err) => {
                    warn!(
                        address = %self.address,
                        attempt,
                        attempts,
                        error = %err,
                        "broker connect attempt failed"
                    );
                    last_error = err;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.wait).await;
            }
        }

        Err(RpcError::Connection {
            attempts,
            source: last_error,
        })
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("address", &self.address)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// FatalSignal
// ---------------------------------------------------------------------------

/// Single-assignment slot for the error that ended a side's link for good.
///
/// Raised at most once, when a reconnect fails. Hosts await it through
/// `notify()` and are expected to terminate.
#[derive(Debug)]
pub(crate) struct FatalSignal {
    tx: watch::Sender<Option<Arc<RpcError>>>,
}

impl FatalSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Stores `err` unless an error was already raised. Returns the stored error.
    pub(crate) fn raise(&self, err: RpcError) -> Arc<RpcError> {
        let err = Arc::new(err);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(Arc::clone(&err));
            true
        });
        self.get().unwrap_or(err)
    }

    pub(crate) fn get(&self) -> Option<Arc<RpcError>> {
        self.tx.borrow().clone()
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Resolves once an error has been raised.
    pub(crate) async fn wait(&self) -> Arc<RpcError> {
        let mut rx = self.tx.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(err) = current {
                return err;
            }
            if rx.changed().await.is_err() {
                // The sender lives as long as `self`, so this is unreachable
                // in practice; never resolve rather than invent an error.
                std::future::pending::<()>().await;
            }
        }
    }
}
