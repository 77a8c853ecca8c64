//! RPC server: dispatches inbound calls to named handlers.
//!
//! [`RpcServer::run`] drains the inbound stream of the server's receive
//! address. Every message takes a worker slot from a bounded semaphore
//! before its task is spawned, so a saturated pool stops intake. Each task
//! invokes the handler, publishes the reply to the caller's reply address
//! and then acknowledges the request whether or not the publish worked.

pub mod handler;
pub mod lifecycle;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use relay_core::{CallStatus, Envelope, RpcError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use self::handler::{HandlerError, Request, Router};
use self::lifecycle::{HealthState, Lifecycle};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionManager, FatalSignal, Inbound};
use crate::transport::{Broker, Delivery};

/// Worker side of a broker-backed RPC link.
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    router: Router,
    manager: ConnectionManager,
    conn: ArcSwap<Connection>,
    /// Taken by the first `run()`.
    inbound: Mutex<Option<Inbound>>,
    slots: Arc<Semaphore>,
    lifecycle: Lifecycle,
    fatal: FatalSignal,
    /// Parent of every handler's cancellation token.
    lifetime: CancellationToken,
    closed: AtomicBool,
}

impl RpcServer {
    /// Connects to the broker and declares the server's receive address.
    /// Calls are not taken until [`run`](Self::run) is awaited.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Connection` if the broker stays unreachable for
    /// every configured attempt.
    pub async fn connect(
        broker: Arc<dyn Broker>,
        router: Router,
        config: ServerConfig,
    ) -> Result<Self, RpcError> {
        let manager =
            ConnectionManager::new(broker, config.address.clone(), config.connect.clone());
        let (conn, inbound) = manager.connect().await?;
        let workers = config.workers.max(1);

        info!(
            address = %config.address,
            workers,
            handlers = ?router.names(),
            "rpc server connected"
        );

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                router,
                manager,
                conn: ArcSwap::new(conn),
                inbound: Mutex::new(Some(inbound)),
                slots: Arc::new(Semaphore::new(workers)),
                lifecycle: Lifecycle::new(),
                fatal: FatalSignal::new(),
                lifetime: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Takes calls until [`shutdown`](Self::shutdown) is called or the
    /// link is lost for good.
    ///
    /// A lost link is replaced once; calls published during the gap are
    /// not recovered.
    ///
    /// # Errors
    ///
    /// Returns the connection error if a reconnect fails. The same error is
    /// delivered through [`notify`](Self::notify).
    pub async fn run(&self) -> Result<(), Arc<RpcError>> {
        let taken = self.inner.inbound.lock().take();
        let Some(mut inbound) = taken else {
            warn!(address = %self.inner.config.address, "rpc server is already running");
            return Ok(());
        };

        let intake = self.inner.lifecycle.intake().clone();
        self.inner.lifecycle.set_ready();
        info!(address = %self.inner.config.address, "rpc server ready");

        loop {
            let delivery = tokio::select! {
                biased;
                () = intake.cancelled() => break,
                delivery = inbound.next() => delivery,
            };

            let Some(delivery) = delivery else {
                match self.inner.reconnect().await? {
                    Some(next) => {
                        inbound = next;
                        continue;
                    }
                    None => break,
                }
            };

            // Counted before the slot wait so shutdown drains queued calls too.
            let guard = self.inner.lifecycle.in_flight_guard();
            let permit = tokio::select! {
                biased;
                () = intake.cancelled() => break,
                permit = Arc::clone(&self.inner.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                inner.serve(delivery).await;
            });
        }

        info!(address = %self.inner.config.address, "rpc server stopped taking calls");
        Ok(())
    }

    /// Resolves with the error that ended the server's link for good.
    pub async fn notify(&self) -> Arc<RpcError> {
        self.inner.fatal.wait().await
    }

    #[must_use]
    pub fn health(&self) -> HealthState {
        self.inner.lifecycle.health_state()
    }

    /// Number of calls currently being handled or waiting for a slot.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.inner.lifecycle.in_flight_count()
    }

    /// Stops intake, waits up to the shutdown grace period for in-flight
    /// handlers, cancels the ones still running and closes the link.
    /// Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Close` if the broker fails to close the link.
    pub async fn shutdown(&self) -> Result<(), RpcError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.lifecycle.trigger_shutdown();
        let grace = self.inner.config.shutdown_grace;
        if !self.inner.lifecycle.wait_for_drain(grace).await {
            warn!(
                in_flight = self.inner.lifecycle.in_flight_count(),
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "shutdown grace expired, canceling remaining handlers"
            );
        }
        self.inner.lifetime.cancel();

        if self.inner.fatal.is_raised() {
            return Ok(());
        }
        self.inner
            .conn
            .load_full()
            .close()
            .await
            .map_err(RpcError::Close)?;
        info!(address = %self.inner.config.address, "rpc server shut down");
        Ok(())
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.inner.lifetime.cancel();
        self.inner.lifecycle.intake().cancel();
    }
}

impl ServerInner {
    async fn serve(&self, delivery: Delivery) {
        let (mut envelope, acker) = delivery.into_parts();
        let span = info_span!(
            "rpc",
            handler = %envelope.handler(),
            correlation_id = %envelope.correlation_id,
            duration_ms = tracing::field::Empty,
            status = tracing::field::Empty,
        );

        async move {
            let start = Instant::now();
            let body = std::mem::take(&mut envelope.body);
            let (status, reply_body) = self.invoke(&envelope, body).await;

            let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("status", status.as_wire());
            debug!(duration_ms, status = status.as_wire(), "call handled");

            let reply = envelope.reply(&status, reply_body);
            if let Err(err) = self.conn.load_full().publish(reply).await {
                warn!(reply_to = %envelope.reply_to, error = %err, "failed to publish reply");
            }
            if let Err(err) = acker.ack().await {
                warn!(error = %err, "failed to acknowledge request");
            }
        }
        .instrument(span)
        .await;
    }

    /// Runs the named handler and maps its outcome onto a reply status.
    async fn invoke(&self, envelope: &Envelope, body: Vec<u8>) -> (CallStatus, Vec<u8>) {
        let Some(handler) = self.router.get(envelope.handler()) else {
            return (CallStatus::BadHandler, Vec::new());
        };

        let request = Request {
            body,
            content_type: envelope.content_type,
            cancel: self.lifetime.child_token(),
        };

        match AssertUnwindSafe(handler.call(request)).catch_unwind().await {
            Ok(Ok(body)) => (CallStatus::Success, body),
            Ok(Err(HandlerError::NotFound)) => (CallStatus::NotFound, Vec::new()),
            Ok(Err(err)) => (CallStatus::failed(err.to_string()), Vec::new()),
            Err(_) => {
                error!("handler panicked");
                (CallStatus::failed("handler panicked"), Vec::new())
            }
        }
    }

    /// Replaces a lost connection. `Ok(None)` means shutdown began first.
    async fn reconnect(&self) -> Result<Option<Inbound>, Arc<RpcError>> {
        let intake = self.lifecycle.intake();
        if intake.is_cancelled() {
            return Ok(None);
        }
        warn!(address = %self.config.address, "broker link lost, reconnecting");

        let result = tokio::select! {
            () = intake.cancelled() => return Ok(None),
            result = self.manager.connect() => result,
        };

        match result {
            Ok((conn, inbound)) => {
                self.conn.store(conn);
                info!(address = %self.config.address, "rpc server reconnected");
                Ok(Some(inbound))
            }
            Err(err) => {
                error!(
                    address = %self.config.address,
                    error = %err,
                    "reconnect failed, rpc server is closed"
                );
                self.lifecycle.mark_stopped();
                Err(self.fatal.raise(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use relay_core::{ContentType, CorrelationId};

    use super::*;
    use crate::config::ConnectConfig;
    use crate::server::handler::handler_fn;
    use crate::transport::memory::MemoryBroker;
    use crate::transport::BrokerLink;

    fn config() -> ServerConfig {
        ServerConfig {
            workers: 2,
            shutdown_grace: Duration::from_millis(200),
            connect: ConnectConfig {
                attempts: 1,
                wait: Duration::from_millis(5),
            },
            ..ServerConfig::default()
        }
    }

    fn router() -> Router {
        Router::new()
            .route(
                "echo",
                handler_fn(|request: Request| async move { Ok::<_, HandlerError>(request.body) }),
            )
            .route(
                "missing",
                handler_fn(|_request: Request| async move {
                    Err::<Vec<u8>, _>(HandlerError::NotFound)
                }),
            )
            .route(
                "boom",
                handler_fn(|_request: Request| async move {
                    Err::<Vec<u8>, _>(HandlerError::failed("wrong amount"))
                }),
            )
            .route(
                "panic",
                handler_fn(|_request: Request| async move {
                    if true {
                        panic!("handler bug");
                    }
                    Ok::<_, HandlerError>(Vec::new())
                }),
            )
    }

    async fn start(broker: &MemoryBroker) -> Arc<RpcServer> {
        let server = Arc::new(
            RpcServer::connect(Arc::new(broker.clone()), router(), config())
                .await
                .unwrap(),
        );
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run().await });
        server
    }

    async fn call(caller: &mut BrokerLink, handler: &str, body: &[u8]) -> Envelope {
        caller
            .link
            .publish(Envelope::request(
                "rpc_server",
                "caller",
                handler,
                CorrelationId::generate(),
                ContentType::Json,
                body.to_vec(),
            ))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), caller.deliveries.recv())
            .await
            .unwrap()
            .unwrap()
            .envelope
    }

    #[tokio::test]
    async fn replies_map_handler_outcomes() {
        let broker = MemoryBroker::new();
        let server = start(&broker).await;
        let mut caller = broker.open("caller").await.unwrap();

        let reply = call(&mut caller, "echo", b"\"hi\"").await;
        assert_eq!(reply.status(), CallStatus::Success);
        assert_eq!(reply.body, b"\"hi\"");

        assert_eq!(
            call(&mut caller, "nope", b"").await.status(),
            CallStatus::BadHandler
        );
        assert_eq!(
            call(&mut caller, "missing", b"").await.status(),
            CallStatus::NotFound
        );
        assert_eq!(
            call(&mut caller, "boom", b"").await.status(),
            CallStatus::failed("wrong amount")
        );
        assert_eq!(
            call(&mut caller, "panic", b"").await.status(),
            CallStatus::failed("handler panicked")
        );

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn health_follows_lifecycle() {
        let broker = MemoryBroker::new();
        let server = RpcServer::connect(Arc::new(broker.clone()), router(), config())
            .await
            .unwrap();
        assert_eq!(server.health(), HealthState::Starting);

        let server = Arc::new(server);
        let running = Arc::clone(&server);
        let run = tokio::spawn(async move { running.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.health(), HealthState::Ready);

        server.shutdown().await.unwrap();
        assert_eq!(server.health(), HealthState::Stopped);
        assert!(run.await.unwrap().is_ok());
        assert_eq!(broker.subscriber_count("rpc_server"), 0);
    }

    #[tokio::test]
    async fn second_run_returns_immediately() {
        let broker = MemoryBroker::new();
        let server = start(&broker).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(server.run().await.is_ok());
        server.shutdown().await.unwrap();
    }
}
