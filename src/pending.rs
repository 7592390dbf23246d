//! Pending call table.
//!
//! Maps call identifiers to the waiter of each in-flight call. Identifiers
//! are assigned sequentially starting from 1 and are never reused within a
//! session, so an identifier below the next one to assign that is no longer
//! in the table was issued and already settled.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Result, SessionError};

/// Outcome delivered to the waiter of a call.
pub type CallOutcome = Result<Value>;

/// One in-flight call.
#[derive(Debug)]
pub struct PendingCall {
    /// Method name, for logging and timeout errors.
    pub method: String,
    /// When the call was registered.
    pub created_at: Instant,
    tx: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    /// Deliver the outcome. Returns `false` if the waiter has gone away.
    pub fn fulfil(self, outcome: CallOutcome) -> bool {
        self.tx.send(outcome).is_ok()
    }
}

/// Table of calls awaiting a response.
#[derive(Debug)]
pub struct PendingCalls {
    calls: HashMap<u64, PendingCall>,
    next_id: u64,
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            calls: HashMap::new(),
            next_id: 1, // 0 is never issued
        }
    }

    /// Assign the next identifier and register a waiter for it.
    pub fn register(&mut self, method: &str) -> (u64, oneshot::Receiver<CallOutcome>) {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                created_at: Instant::now(),
                tx,
            },
        );
        (id, rx)
    }

    /// Remove and return the entry for `id`.
    pub fn take(&mut self, id: u64) -> Option<PendingCall> {
        self.calls.remove(&id)
    }

    /// Whether `id` has been assigned in this session.
    pub fn was_issued(&self, id: u64) -> bool {
        id != 0 && id < self.next_id
    }

    /// Whether `id` is still awaiting a response.
    pub fn contains(&self, id: u64) -> bool {
        self.calls.contains_key(&id)
    }

    /// Number of calls in flight.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Check if no calls are in flight.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Fail every in-flight call with [`SessionError::SessionClosed`].
    ///
    /// Returns how many calls were failed.
    pub fn drain_closed(&mut self) -> usize {
        let count = self.calls.len();
        for (id, call) in self.calls.drain() {
            tracing::debug!(id, method = %call.method, "Failing pending call: session closed");
            call.fulfil(Err(SessionError::SessionClosed));
        }
        count
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}
