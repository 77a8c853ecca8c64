//! RPC client: synchronous-looking calls over the broker.
//!
//! Each call publishes a request envelope to the server's receive address,
//! parks on a single-fire reply slot keyed by its correlation id, and
//! races that slot against the call timeout and the caller's
//! cancellation token. One background task per connection acknowledges
//! inbound replies and resolves the matching slot. When the inbound
//! stream ends the same task reconnects once; if that fails the client is
//! fatally closed and [`RpcClient::notify`] resolves.

mod pending;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use relay_core::{CorrelationId, Envelope, RpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::pending::{PendingCalls, Reply};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionManager, FatalSignal, Inbound};
use crate::transport::{Broker, Delivery};

/// Polling interval while waiting for outstanding calls during shutdown.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Calling side of a broker-backed RPC link.
pub struct RpcClient {
    inner: Arc<ClientInner>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

struct ClientInner {
    config: ClientConfig,
    manager: ConnectionManager,
    conn: ArcSwap<Connection>,
    pending: PendingCalls,
    /// `true` while no usable link is installed.
    link_down: watch::Sender<bool>,
    fatal: FatalSignal,
    stop: CancellationToken,
    closed: AtomicBool,
}

impl RpcClient {
    /// Connects to the broker, declares the client's receive address and
    /// starts the background receive loop.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Connection` if the broker stays unreachable for
    /// every configured attempt.
    pub async fn connect(broker: Arc<dyn Broker>, config: ClientConfig) -> Result<Self, RpcError> {
        let manager = ConnectionManager::new(
            broker,
            config.client_address.clone(),
            config.connect.clone(),
        );
        let (conn, inbound) = manager.connect().await?;
        let (link_down, _) = watch::channel(false);

        let inner = Arc::new(ClientInner {
            config,
            manager,
            conn: ArcSwap::new(conn),
            pending: PendingCalls::default(),
            link_down,
            fatal: FatalSignal::new(),
            stop: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let handle = tokio::spawn(receive_loop(Arc::clone(&inner), inbound));
        info!(
            client = %inner.config.client_address,
            server = %inner.config.server_address,
            "rpc client connected"
        );

        Ok(Self {
            inner,
            receiver: Mutex::new(Some(handle)),
        })
    }

    /// Calls `handler` on the server with a serialized `request` and
    /// decodes the reply body into `Resp`.
    ///
    /// # Errors
    ///
    /// - `ConnectionClosed` if the link is down for longer than one timeout
    /// - `Serialize` / `Publish` if the request cannot be sent
    /// - `Timeout` if no reply arrives in time
    /// - `Canceled` if `cancel` fires first
    /// - `BadHandler`, `NotFound` or `Remote` for failure replies
    /// - `Deserialize` if the reply body does not decode into `Resp`
    pub async fn remote_call<Req, Resp>(
        &self,
        cancel: &CancellationToken,
        handler: &str,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.inner.await_link().await?;
        let body = self
            .inner
            .config
            .content_type
            .encode(request)
            .map_err(RpcError::Serialize)?;
        self.inner.dispatch(cancel, handler, body).await
    }

    /// Like [`remote_call`](Self::remote_call) but sends an empty body.
    ///
    /// # Errors
    ///
    /// Same as [`remote_call`](Self::remote_call), minus `Serialize`.
    pub async fn remote_call_empty<Resp>(
        &self,
        cancel: &CancellationToken,
        handler: &str,
    ) -> Result<Resp, RpcError>
    where
        Resp: DeserializeOwned,
    {
        self.inner.await_link().await?;
        self.inner.dispatch(cancel, handler, Vec::new()).await
    }

    /// Resolves with the error that made the client unusable.
    ///
    /// Only a failed reconnect raises it; the host should treat it as fatal.
    pub async fn notify(&self) -> Arc<RpcError> {
        self.inner.fatal.wait().await
    }

    /// Returns `true` while a link is installed and not shutting down.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst) && !*self.inner.link_down.borrow()
    }

    /// Number of calls currently waiting for a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Stops accepting calls, lets outstanding calls finish for up to one
    /// timeout interval, then closes the link. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Close` if the broker fails to close the link.
    pub async fn shutdown(&self) -> Result<(), RpcError> {
        if self.inner.fatal.is_raised() || self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.link_down.send_replace(true);

        let deadline = tokio::time::Instant::now() + self.inner.config.timeout;
        while !self.inner.pending.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        self.inner.stop.cancel();
        let receiver = self.receiver.lock().take();
        if let Some(handle) = receiver {
            let _ = handle.await;
        }
        // A reconnect may have cleared the flag during the drain.
        self.inner.link_down.send_replace(true);

        self.inner
            .conn
            .load_full()
            .close()
            .await
            .map_err(RpcError::Close)?;
        info!(client = %self.inner.config.client_address, "rpc client shut down");
        Ok(())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.inner.stop.cancel();
    }
}

impl ClientInner {
    /// Grace period for an in-progress reconnect: waits up to one timeout
    /// for the link to come back.
    async fn await_link(&self) -> Result<(), RpcError> {
        if self.closed.load(Ordering::SeqCst) || self.fatal.is_raised() {
            return Err(RpcError::ConnectionClosed);
        }
        let mut rx = self.link_down.subscribe();
        if !*rx.borrow_and_update() {
            return Ok(());
        }

        let restored = tokio::time::timeout(self.config.timeout, rx.wait_for(|down| !*down))
            .await
            .is_ok_and(|changed| changed.is_ok());
        if restored {
            Ok(())
        } else {
            Err(RpcError::ConnectionClosed)
        }
    }

    async fn dispatch<Resp>(
        &self,
        cancel: &CancellationToken,
        handler: &str,
        body: Vec<u8>,
    ) -> Result<Resp, RpcError>
    where
        Resp: DeserializeOwned,
    {
        let correlation_id = CorrelationId::generate();
        let conn = self.conn.load_full();
        let envelope = Envelope::request(
            self.config.server_address.as_str(),
            conn.address(),
            handler,
            correlation_id.clone(),
            self.config.content_type,
            body,
        );

        // Registered before publishing so a fast reply cannot race past it.
        let (_guard, reply_rx) = self.pending.register(correlation_id.clone());
        conn.publish(envelope).await.map_err(RpcError::Publish)?;

        let timeout = self.config.timeout;
        let reply = tokio::select! {
            () = tokio::time::sleep(timeout) => {
                debug!(handler, correlation_id = %correlation_id, "call timed out");
                return Err(RpcError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            () = cancel.cancelled() => {
                debug!(handler, correlation_id = %correlation_id, "call canceled");
                return Err(RpcError::Canceled);
            }
            reply = reply_rx => reply.map_err(|_| RpcError::ConnectionClosed)?,
        };

        decode_reply(reply)
    }

    async fn accept(&self, delivery: Delivery) {
        if let Err(err) = delivery.ack().await {
            warn!(error = %err, "failed to acknowledge reply");
        }

        let envelope = delivery.envelope;
        let reply = Reply {
            status: envelope.status(),
            content_type: envelope.content_type,
            body: envelope.body,
        };
        if !self.pending.resolve(envelope.correlation_id.as_str(), reply) {
            debug!(
                correlation_id = %envelope.correlation_id,
                "dropping reply with no pending call"
            );
        }
    }

    /// Replaces a lost connection. Returns the new inbound stream, or
    /// `None` if the client stopped or the reconnect failed.
    async fn reconnect(&self) -> Option<Inbound> {
        self.link_down.send_replace(true);
        if self.stop.is_cancelled() {
            return None;
        }
        warn!(client = %self.config.client_address, "broker link lost, reconnecting");

        let result = tokio::select! {
            () = self.stop.cancelled() => return None,
            result = self.manager.connect() => result,
        };

        match result {
            Ok((conn, inbound)) => {
                if self.closed.load(Ordering::SeqCst) {
                    // Shutdown began while connecting; the new link is not used.
                    if let Err(err) = conn.close().await {
                        warn!(error = %err, "failed to close link opened during shutdown");
                    }
                    return None;
                }
                self.conn.store(conn);
                self.link_down.send_replace(false);
                info!(client = %self.config.client_address, "rpc client reconnected");
                Some(inbound)
            }
            Err(err) => {
                error!(
                    client = %self.config.client_address,
                    error = %err,
                    "reconnect failed, rpc client is closed"
                );
                self.fatal.raise(err);
                None
            }
        }
    }
}

fn decode_reply<Resp: DeserializeOwned>(reply: Reply) -> Result<Resp, RpcError> {
    reply.status.into_result()?;
    reply
        .content_type
        .decode(&reply.body)
        .map_err(RpcError::Deserialize)
}

async fn receive_loop(inner: Arc<ClientInner>, mut inbound: Inbound) {
    loop {
        let delivery = tokio::select! {
            biased;
            () = inner.stop.cancelled() => break,
            delivery = inbound.next() => delivery,
        };

        match delivery {
            Some(delivery) => inner.accept(delivery).await,
            None => match inner.reconnect().await {
                Some(next) => inbound = next,
                None => return,
            },
        }
    }

    // Stopped without `shutdown()`: the client was dropped.
    if !inner.closed.load(Ordering::SeqCst) && !inner.fatal.is_raised() {
        if let Err(err) = inner.conn.load_full().close().await {
            warn!(error = %err, "failed to close link of dropped client");
        }
        debug!(client = %inner.config.client_address, "rpc client dropped, link closed");
    }
}
