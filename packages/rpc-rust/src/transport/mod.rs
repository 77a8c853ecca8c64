//! Broker transport seam.
//!
//! A [`Broker`] opens a [`BrokerLink`]: a [`Link`] to publish envelopes
//! with, plus the stream of [`Delivery`] values addressed to the receive
//! address this side declared. The stream ends when the link is lost.
//!
//! Backends:
//! - [`memory::MemoryBroker`] -- in-process, with fault injection for tests
//! - `amqp::AmqpBroker` -- `RabbitMQ` via `lapin` (feature `amqp`)

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{Envelope, TransportError};
use tokio::sync::mpsc;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

/// Capacity of the buffer between a backend and its inbound consumer.
pub const DELIVERY_BUFFER: usize = 1024;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Entry point into a message broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Declares `address` as this side's receive address and starts
    /// receiving messages published to it.
    async fn open(&self, address: &str) -> Result<BrokerLink, TransportError>;
}

/// Send side of an open broker link.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Publishes an envelope to its `destination`.
    async fn publish(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Closes the link. Its inbound stream ends afterwards.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Acknowledgement capability attached to one inbound message.
#[async_trait]
pub trait Acknowledge: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// BrokerLink / Delivery
// ---------------------------------------------------------------------------

/// A freshly opened link and its inbound message stream.
pub struct BrokerLink {
    pub link: Arc<dyn Link>,
    pub deliveries: mpsc::Receiver<Delivery>,
}

impl BrokerLink {
    #[must_use]
    pub fn new(link: Arc<dyn Link>, deliveries: mpsc::Receiver<Delivery>) -> Self {
        Self { link, deliveries }
    }
}

/// One inbound message awaiting acknowledgement.
pub struct Delivery {
    pub envelope: Envelope,
    acker: Acker,
}

impl Delivery {
    #[must_use]
    pub fn new(envelope: Envelope, acker: Arc<dyn Acknowledge>) -> Self {
        Self {
            envelope,
            acker: Acker(acker),
        }
    }

    /// Acknowledges the message to the broker.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Ack` if the broker rejects the acknowledgement.
    pub async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    /// Splits the delivery so the envelope can be consumed while the
    /// acknowledgement is deferred.
    #[must_use]
    pub fn into_parts(self) -> (Envelope, Acker) {
        (self.envelope, self.acker)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Detached acknowledgement handle of a [`Delivery`].
#[derive(Clone)]
pub struct Acker(Arc<dyn Acknowledge>);

impl Acker {
    /// # Errors
    ///
    /// Returns `TransportError::Ack` if the broker rejects the acknowledgement.
    pub async fn ack(&self) -> Result<(), TransportError> {
        self.0.ack().await
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Acker")
    }
}
