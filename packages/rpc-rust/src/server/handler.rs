//! Named call handlers and the router that holds them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{CodecError, ContentType};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Request / HandlerError
// ---------------------------------------------------------------------------

/// One inbound call as seen by a handler.
#[derive(Debug)]
pub struct Request {
    /// Serialized request payload; empty for a nil request.
    pub body: Vec<u8>,
    /// Codec the caller used; replies are encoded the same way.
    pub content_type: ContentType,
    /// Fires when the server shuts down. The caller's own cancellation is
    /// never propagated through the broker.
    pub cancel: CancellationToken,
}

impl Request {
    /// Decodes the body into `T`.
    ///
    /// # Errors
    ///
    /// Returns `HandlerError::InvalidRequest` if the body does not decode.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        self.content_type
            .decode(&self.body)
            .map_err(HandlerError::InvalidRequest)
    }

    /// Encodes a response in the caller's content type.
    ///
    /// # Errors
    ///
    /// Returns `HandlerError::Failed` if the value cannot be serialized.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, HandlerError> {
        self.content_type
            .encode(value)
            .map_err(|e| HandlerError::Failed(e.into()))
    }
}

/// Failure returned by a handler.
///
/// Only `NotFound` keeps its identity on the wire. Every other variant is
/// reduced to its display text.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("not found")]
    NotFound,
    #[error("invalid request body: {0}")]
    InvalidRequest(#[source] CodecError),
    #[error("{0}")]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    /// Builds a free-text failure.
    pub fn failed(message: impl fmt::Display) -> Self {
        Self::Failed(anyhow::anyhow!("{message}"))
    }
}

// ---------------------------------------------------------------------------
// CallHandler
// ---------------------------------------------------------------------------

/// Server-side function invoked for one request type.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    /// Handles one call, returning the serialized response body.
    async fn call(&self, request: Request) -> Result<Vec<u8>, HandlerError>;
}

/// Adapter turning an async closure over raw [`Request`]s into a handler.
pub struct HandlerFn<F>(F);

/// Wraps `f` as a raw-bytes [`CallHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> CallHandler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
{
    async fn call(&self, request: Request) -> Result<Vec<u8>, HandlerError> {
        (self.0)(request).await
    }
}

/// Handler that decodes `Req` and encodes `Resp` using the request's codec.
pub struct Typed<F, Req, Resp> {
    f: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

#[async_trait]
impl<F, Fut, Req, Resp> CallHandler for Typed<F, Req, Resp>
where
    F: Fn(Req, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn call(&self, request: Request) -> Result<Vec<u8>, HandlerError> {
        let decoded: Req = request.decode()?;
        let response = (self.f)(decoded, request.cancel.clone()).await?;
        request.encode(&response)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Handler registry keyed by handler name.
#[derive(Clone, Default)]
pub struct Router {
    handlers: HashMap<String, Arc<dyn CallHandler>>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. A later registration under the same name wins.
    #[must_use]
    pub fn route(mut self, name: impl Into<String>, handler: impl CallHandler) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Registers a typed handler: the request is decoded into `Req` and the
    /// returned `Resp` is encoded with the caller's content type.
    #[must_use]
    pub fn typed<F, Fut, Req, Resp>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Req, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        self.route(
            name,
            Typed {
                f,
                _marker: PhantomData,
            },
        )
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn CallHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered handler names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct GetWallet {
        id: String,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Wallet {
        id: String,
        balance: i64,
    }

    fn request(content_type: ContentType, body: Vec<u8>) -> Request {
        Request {
            body,
            content_type,
            cancel: CancellationToken::new(),
        }
    }

    fn wallet_router() -> Router {
        Router::new().typed("wallet.get", |req: GetWallet, _cancel| async move {
            if req.id == "w1" {
                Ok(Wallet {
                    id: req.id,
                    balance: 100,
                })
            } else {
                Err(HandlerError::NotFound)
            }
        })
    }

    #[tokio::test]
    async fn typed_handler_uses_request_codec() {
        let router = wallet_router();
        let handler = router.get("wallet.get").unwrap();

        let body = ContentType::MsgPack
            .encode(&GetWallet {
                id: "w1".to_string(),
            })
            .unwrap();
        let reply = handler
            .call(request(ContentType::MsgPack, body))
            .await
            .unwrap();

        let wallet: Wallet = ContentType::MsgPack.decode(&reply).unwrap();
        assert_eq!(wallet.balance, 100);
    }

    #[tokio::test]
    async fn typed_handler_propagates_not_found() {
        let handler = wallet_router().get("wallet.get").unwrap();
        let err = handler
            .call(request(ContentType::Json, br#"{"id":"w9"}"#.to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::NotFound));
    }

    #[tokio::test]
    async fn undecodable_request_is_invalid() {
        let handler = wallet_router().get("wallet.get").unwrap();
        let err = handler
            .call(request(ContentType::Json, b"[1,2]".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidRequest(_)));
        assert!(err.to_string().starts_with("invalid request body"));
    }

    #[tokio::test]
    async fn raw_handler_sees_bytes() {
        let router = Router::new().route(
            "echo",
            handler_fn(|request: Request| async move { Ok::<_, HandlerError>(request.body) }),
        );
        let reply = router
            .get("echo")
            .unwrap()
            .call(request(ContentType::Json, b"\"hi\"".to_vec()))
            .await
            .unwrap();
        assert_eq!(reply, b"\"hi\"");
    }

    #[test]
    fn failed_keeps_message_text() {
        let err = HandlerError::failed("wrong amount");
        assert_eq!(err.to_string(), "wrong amount");

        let err: HandlerError = anyhow::anyhow!("sender is receiver").into();
        assert_eq!(err.to_string(), "sender is receiver");
    }

    #[test]
    fn router_lookup_and_names() {
        let router = wallet_router().route(
            "echo",
            handler_fn(|request: Request| async move { Ok::<_, HandlerError>(request.body) }),
        );
        assert_eq!(router.len(), 2);
        assert!(!router.is_empty());
        assert_eq!(router.names(), vec!["echo", "wallet.get"]);
        assert!(router.get("missing").is_none());
    }
}
