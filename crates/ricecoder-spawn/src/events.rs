//! Events raised by child processes and their redirected streams

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::ProcessError;

/// A line received on a redirected output or error stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineReceived {
    line: String,
}

impl LineReceived {
    /// Create a new line event
    pub fn new(line: impl Into<String>) -> Self {
        Self { line: line.into() }
    }

    /// The line, without its terminator
    pub fn line(&self) -> &str {
        &self.line
    }
}

/// Raised once when a process has exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExited {
    /// Process ID
    pub pid: u32,
    /// Exit code of the process
    pub exit_code: i32,
}

/// Identifies a handler registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Returned by stand-ins that never deliver events
    pub const NONE: SubscriptionId = SubscriptionId(0);
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared event handler
pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handler for [`LineReceived`] events
pub type LineHandler = Handler<LineReceived>;

/// Ordered list of independent handlers.
///
/// Every handler runs inside its own panic boundary: a panicking handler is
/// logged as a [`ProcessError::SubscriberFault`] and the remaining handlers
/// still see the event.
pub(crate) struct Subscribers<E> {
    event: &'static str,
    next_id: AtomicU64,
    handlers: Mutex<Vec<(SubscriptionId, Handler<E>)>>,
}

impl<E> Subscribers<E> {
    pub(crate) fn new(event: &'static str) -> Self {
        Self {
            event,
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self, handler: Handler<E>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, handler));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Deliver `event` to the handlers registered right now; returns the
    /// number of handlers that panicked
    pub(crate) fn dispatch(&self, event: &E) -> usize {
        let snapshot: Vec<Handler<E>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        let mut faults = 0;
        for handler in snapshot {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                faults += 1;
                let fault = ProcessError::SubscriberFault {
                    event: self.event,
                    message: panic_message(payload.as_ref()),
                };
                warn!(error = %fault, "Event handler failed");
            }
        }
        faults
    }
}

impl<E> fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("event", &self.event)
            .field("handlers", &self.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
