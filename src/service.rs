//! Service handlers and the immutable method-to-handler mapping.
//!
//! Handlers are bound to `(service, method)` pairs on a
//! [`ServiceHandlerSetBuilder`] at server construction time. The resulting
//! [`ServiceHandlerSet`] is handed to the listener and can no longer change,
//! so there is no way to bind a handler once serving has begun.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::codec::{Codec, XdrCodec};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::protocol::rpc::CallContext;
use crate::schema::{MessageSchema, MethodDefinition, SchemaRegistry};

/// Failure reported by a handler. It reaches the caller as a remote error;
/// the connection and other calls are unaffected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    cancelled: bool,
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { cancelled: false, message: message.into() }
    }

    /// The handler stopped because the call was cancelled.
    pub fn cancelled() -> Self {
        Self { cancelled: true, message: "call cancelled".to_string() }
    }

    pub fn is_cancellation(&self) -> bool {
        self.cancelled
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Business logic bound to one method.
///
/// Distinct calls may run the same handler concurrently. Any state shared
/// between calls must be synchronized by the handler itself.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Handles one decoded request and produces the response message.
    async fn handle(
        &self,
        request: Message,
        context: CallContext,
    ) -> std::result::Result<Message, HandlerError>;
}

/// Handler backed by an async closure, see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure into a [`ServiceHandler`].
///
/// ```ignore
/// let hello = handler_fn(|request: Message, _ctx| async move {
///     Ok(Message::new().with("greeting", "bar"))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Message, HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ServiceHandler for FnHandler<F>
where
    F: Fn(Message, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Message, HandlerError>> + Send,
{
    async fn handle(
        &self,
        request: Message,
        context: CallContext,
    ) -> std::result::Result<Message, HandlerError> {
        (self.f)(request, context).await
    }
}

/// A handler together with the resolved layouts of its method.
pub(crate) struct BoundMethod {
    pub definition: MethodDefinition,
    pub request: Arc<MessageSchema>,
    pub response: Arc<MessageSchema>,
    pub handler: Arc<dyn ServiceHandler>,
}

/// Immutable mapping from `(service, method)` to handler.
pub struct ServiceHandlerSet {
    registry: Arc<SchemaRegistry>,
    codec: Arc<dyn Codec>,
    services: HashMap<String, HashMap<String, BoundMethod>>,
}

impl ServiceHandlerSet {
    pub fn builder(registry: Arc<SchemaRegistry>) -> ServiceHandlerSetBuilder {
        ServiceHandlerSetBuilder {
            codec: Arc::new(XdrCodec::new(registry.clone())),
            registry,
            services: HashMap::new(),
        }
    }

    pub(crate) fn lookup(&self, service: &str, method: &str) -> Option<&BoundMethod> {
        self.services.get(service).and_then(|methods| methods.get(method))
    }

    pub fn is_bound(&self, service: &str, method: &str) -> bool {
        self.lookup(service, method).is_some()
    }

    /// Number of bound methods across all services.
    pub fn len(&self) -> usize {
        self.services.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }
}

impl fmt::Debug for ServiceHandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bound: Vec<String> = self
            .services
            .iter()
            .flat_map(|(service, methods)| methods.keys().map(move |m| format!("{service}/{m}")))
            .collect();
        f.debug_struct("ServiceHandlerSet").field("bound", &bound).finish()
    }
}

/// Collects handler bindings before the server starts.
pub struct ServiceHandlerSetBuilder {
    registry: Arc<SchemaRegistry>,
    codec: Arc<dyn Codec>,
    services: HashMap<String, HashMap<String, BoundMethod>>,
}

impl ServiceHandlerSetBuilder {
    /// Replaces the default [`XdrCodec`].
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Binds `handler` to `service/method`.
    ///
    /// The method must be defined in the registry and may be bound only once.
    pub fn bind<H>(mut self, service: &str, method: &str, handler: H) -> Result<Self>
    where
        H: ServiceHandler + 'static,
    {
        let (definition, request, response) = self.registry.resolve_method(service, method)?;
        let methods = self.services.entry(service.to_string()).or_default();
        if methods.contains_key(method) {
            return Err(Error::HandlerAlreadyBound {
                service: service.to_string(),
                method: method.to_string(),
            });
        }
        debug!("Bound handler for {}/{}", service, method);
        methods.insert(
            method.to_string(),
            BoundMethod { definition, request, response, handler: Arc::new(handler) },
        );
        Ok(self)
    }

    pub fn build(self) -> ServiceHandlerSet {
        ServiceHandlerSet { registry: self.registry, codec: self.codec, services: self.services }
    }
}
