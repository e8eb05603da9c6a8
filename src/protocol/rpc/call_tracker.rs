//! In-flight call tracking for one session.
//!
//! Every call being handled is registered under its xid together with the
//! sender half of its cancellation signal. This lets the session:
//!
//! - drop a second CALL reusing an xid that is still in flight,
//! - raise the signal when the client sends CANCEL for that xid,
//! - raise every signal when the session goes away.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

/// Tracks the calls of one session that have not been answered yet
#[derive(Debug, Default)]
pub struct CallTracker {
    calls: Mutex<HashMap<u32, watch::Sender<bool>>>,
}

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> MutexGuard<'_, HashMap<u32, watch::Sender<bool>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new call.
    ///
    /// Returns the cancellation receiver for the handler, or `None` when a call
    /// with the same xid is still in flight.
    pub fn begin(&self, xid: u32) -> Option<watch::Receiver<bool>> {
        let mut calls = self.calls();
        if calls.contains_key(&xid) {
            return None;
        }
        let (sender, receiver) = watch::channel(false);
        calls.insert(xid, sender);
        Some(receiver)
    }

    /// Forgets a call once its reply has been queued.
    pub fn finish(&self, xid: u32) {
        self.calls().remove(&xid);
    }

    /// Signals cancellation to the handler of `xid`. Returns whether the call was in flight.
    pub fn cancel(&self, xid: u32) -> bool {
        match self.calls().get(&xid) {
            Some(sender) => {
                sender.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Signals cancellation to every call of the session.
    pub fn cancel_all(&self) {
        for sender in self.calls().values() {
            sender.send_replace(true);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.calls().len()
    }
}
