//! Command vocabulary and request tracking
//!
//! This module provides:
//! - The fixed set of commands we issue to the device daemon
//! - Per-engine request id assignment and the pending-request table
//! - [`ResponseHandle`], the single-assignment result of one command

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};

use serde_json::{json, Value};
use tokio::sync::oneshot;

use devwatch_core::prelude::*;

/// Commands issued by the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonCommand {
    /// Handshake: start emitting device events
    EnableDevices,
    /// Ask the daemon to exit
    Shutdown,
}

impl DaemonCommand {
    pub fn method(&self) -> &'static str {
        match self {
            DaemonCommand::EnableDevices => "device.enable",
            DaemonCommand::Shutdown => "daemon.shutdown",
        }
    }

    pub fn params(&self) -> Value {
        json!({})
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            DaemonCommand::EnableDevices => "enable devices",
            DaemonCommand::Shutdown => "shutdown daemon",
        }
    }
}

/// A command awaiting its response
struct PendingRequest {
    method: String,
    response_tx: oneshot::Sender<Result<Value>>,
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct IdCounter {
    next: u64,
    closed: bool,
}

/// Assigns ids and tracks pending requests for one engine.
///
/// Ids start at 0 and are never reused. [`RequestTracker::register`] holds the
/// id lock while the framed command is written, so wire order matches id order.
pub struct RequestTracker {
    ids: Mutex<IdCounter>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            ids: Mutex::new(IdCounter::default()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a request and hand its id to `write`.
    ///
    /// If `write` fails the entry is removed again and the error returned.
    /// Fails with `EngineDisposed` once [`RequestTracker::cancel_all`] ran.
    pub fn register<F>(&self, method: &str, write: F) -> Result<ResponseHandle>
    where
        F: FnOnce(u64) -> Result<()>,
    {
        let mut ids = lock(&self.ids);
        if ids.closed {
            return Err(Error::EngineDisposed);
        }
        let id = ids.next;
        let (tx, rx) = oneshot::channel();

        lock(&self.pending).insert(
            id,
            PendingRequest {
                method: method.to_string(),
                response_tx: tx,
            },
        );

        if let Err(e) = write(id) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        ids.next += 1;
        Ok(ResponseHandle {
            id,
            method: method.to_string(),
            rx,
        })
    }

    /// Method name of a pending request, if any
    pub fn method_of(&self, id: u64) -> Option<String> {
        lock(&self.pending).get(&id).map(|p| p.method.clone())
    }

    /// Settle the request with this id.
    ///
    /// Returns false if no request with that id is pending.
    pub fn settle(&self, id: u64, outcome: Result<Value>) -> bool {
        let Some(pending) = lock(&self.pending).remove(&id) else {
            return false;
        };
        // The caller may have dropped its handle; that is fine.
        let _ = pending.response_tx.send(outcome);
        true
    }

    /// Settle every pending request with `EngineDisposed` and refuse new ones.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut ids = lock(&self.ids);
            ids.closed = true;
            let drained = lock(&self.pending).drain().collect();
            drained
        };
        let count = drained.len();
        for (_, req) in drained {
            let _ = req.response_tx.send(Err(Error::EngineDisposed));
        }
        count
    }

    /// Get the number of pending requests
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one command; resolves when its response arrives.
///
/// Resolves to [`Error::EngineDisposed`] if the engine is disposed (or dropped)
/// first. Poll it through `&mut` to wait with a timeout without consuming it.
#[derive(Debug)]
pub struct ResponseHandle {
    id: u64,
    method: String,
    rx: oneshot::Receiver<Result<Value>>,
}

impl ResponseHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Future for ResponseHandle {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::EngineDisposed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
