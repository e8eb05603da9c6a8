//! Execution contexts.
//!
//! [`Context`] is the per-session state the dispatcher needs to route calls.
//! [`CallContext`] is what a handler sees for one call: the method being
//! served, the client deadline and a cancellation signal. It deliberately
//! exposes nothing about the transport.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::service::{HandlerError, ServiceHandlerSet};

use super::CallTracker;

/// Per-session dispatch state
///
/// Each accepted session owns one `Context`; clones are handed to the tasks
/// serving individual calls.
#[derive(Clone)]
pub struct Context {
    /// Port number on which the server is listening
    pub local_port: u16,

    /// Client's network address (IP:port), used for logging
    pub client_addr: String,

    /// Immutable method-to-handler mapping built at server construction
    pub handlers: Arc<ServiceHandlerSet>,

    /// Calls of this session that are still being handled
    pub call_tracker: Arc<CallTracker>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("rpc::Context")
            .field("local_port", &self.local_port)
            .field("client_addr", &self.client_addr)
            .field("in_flight", &self.call_tracker.in_flight())
            .finish()
    }
}

/// What a handler knows about the call it serves.
#[derive(Clone)]
pub struct CallContext {
    service: Arc<str>,
    method: Arc<str>,
    deadline: Option<Instant>,
    cancellation: watch::Receiver<bool>,
}

impl CallContext {
    pub(crate) fn new(
        service: &str,
        method: &str,
        deadline: Option<Instant>,
        cancellation: watch::Receiver<bool>,
    ) -> Self {
        Self { service: service.into(), method: method.into(), deadline, cancellation }
    }

    /// A context that is never cancelled, for invoking handlers outside a server.
    pub fn detached(service: &str, method: &str, deadline: Option<Instant>) -> Self {
        let (_, cancellation) = watch::channel(false);
        Self::new(service, method, deadline, cancellation)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Deadline propagated by the client, if it set one.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the client abandoned the call, the session went away or the
    /// deadline passed. This is a hint; the handler decides whether to stop.
    pub fn is_cancelled(&self) -> bool {
        *self.cancellation.borrow() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Shorthand for handlers that want to bail out with the matching error.
    pub fn check_cancelled(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            Err(HandlerError::cancelled())
        } else {
            Ok(())
        }
    }

    /// Completes when [`CallContext::is_cancelled`] becomes true.
    pub async fn cancelled(&self) {
        let mut cancellation = self.cancellation.clone();
        let signalled = async move {
            loop {
                if *cancellation.borrow_and_update() {
                    return;
                }
                if cancellation.changed().await.is_err() {
                    // Nobody can cancel any more.
                    std::future::pending::<()>().await;
                }
            }
        };
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = signalled => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => signalled.await,
        }
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("service", &self.service)
            .field("method", &self.method)
            .field("deadline", &self.deadline)
            .field("cancelled", &*self.cancellation.borrow())
            .finish()
    }
}
