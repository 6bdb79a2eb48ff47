//! Event-driven fan-out of lines read from a redirected stream
//!
//! A [`LineMultiplexer`] drains a [`LineSource`] one line at a time and
//! hands every line to all current subscribers before it reads the next
//! one, so each subscriber sees the stream in order. End-of-stream moves the
//! multiplexer to [`DrainState::Drained`], which is what
//! [`LineEvents::wait_for_all`] waits for.
//!
//! [`NullLineMultiplexer`] stands in for a stream that was not redirected:
//! it is drained from the start and accepts subscriptions without ever
//! delivering anything.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{ProcessError, Result};
use crate::events::{LineHandler, LineReceived, SubscriptionId, Subscribers};

/// Read errors in a row after which a stream is given up on
const MAX_CONSECUTIVE_READ_FAILURES: u32 = 16;

/// Source of lines for a multiplexer
#[async_trait]
pub trait LineSource: Send + Sync {
    /// Next line without its terminator, or `None` at end-of-stream
    async fn next_line(&self) -> Result<Option<String>>;
}

/// Event-driven view of a line stream
#[async_trait]
pub trait LineEvents: Send + Sync + fmt::Debug {
    /// Register a handler for every line read from now on
    fn subscribe(&self, handler: LineHandler) -> SubscriptionId;

    /// Remove a handler; returns whether it was registered
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Begin reading. Later calls are no-ops.
    fn start(&self) -> Result<()>;

    /// Wait until the stream is drained or `timeout` elapses; returns
    /// whether the stream was drained
    async fn wait_for_all(&self, timeout: Duration) -> bool;

    /// Whether end-of-stream has been reached (or the multiplexer disposed)
    fn is_drained(&self) -> bool;

    /// Stop reading and release every waiter
    fn dispose(&self);
}

/// Progress of a multiplexer through its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    /// `start` has not been called
    NotStarted,
    /// A read is outstanding or a line is being delivered
    ReadPending,
    /// End-of-stream reached, or disposed
    Drained,
}

struct Shared {
    source: Arc<dyn LineSource>,
    subscribers: Subscribers<LineReceived>,
    state: watch::Sender<DrainState>,
}

/// Multiplexer over a live line source
pub struct LineMultiplexer {
    shared: Arc<Shared>,
    started: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LineMultiplexer {
    /// Create a multiplexer over `source`; nothing is read until
    /// [`start`](LineEvents::start)
    pub fn new(source: Arc<dyn LineSource>) -> Self {
        let (state, _) = watch::channel(DrainState::NotStarted);
        Self {
            shared: Arc::new(Shared {
                source,
                subscribers: Subscribers::new("line received"),
                state,
            }),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> DrainState {
        *self.shared.state.borrow()
    }

    async fn pump(shared: Arc<Shared>, cancel: CancellationToken) {
        let mut delivered = 0usize;
        let mut failures = 0u32;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = shared.source.next_line() => next,
            };

            match next {
                Ok(Some(line)) => {
                    failures = 0;
                    shared.subscribers.dispatch(&LineReceived::new(line));
                    delivered += 1;
                }
                Ok(None) => break,
                Err(e) if e.is_invalid_state() => break,
                Err(e) if failures < MAX_CONSECUTIVE_READ_FAILURES => {
                    failures += 1;
                    warn!(error = %e, attempt = failures, "Line read failed, reading on");
                }
                Err(e) => {
                    error!(error = %e, "Line reads keep failing, treating stream as drained");
                    break;
                }
            }
        }

        debug!(lines = delivered, "Line stream drained");
        shared.state.send_replace(DrainState::Drained);
    }
}

#[async_trait]
impl LineEvents for LineMultiplexer {
    fn subscribe(&self, handler: LineHandler) -> SubscriptionId {
        self.shared.subscribers.subscribe(handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.subscribers.unsubscribe(id)
    }

    fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProcessError::Disposed("line multiplexer"));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ProcessError::NoRuntime)?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shared.state.send_if_modified(|state| {
            if *state == DrainState::NotStarted {
                *state = DrainState::ReadPending;
                true
            } else {
                false
            }
        });
        let task = runtime.spawn(Self::pump(Arc::clone(&self.shared), self.cancel.clone()));
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn wait_for_all(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.subscribe();
        let outcome =
            tokio::time::timeout(timeout, state.wait_for(|s| *s == DrainState::Drained)).await;
        matches!(outcome, Ok(Ok(_)))
    }

    fn is_drained(&self) -> bool {
        self.state() == DrainState::Drained
    }

    fn dispose(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.task.lock().take();
        self.shared.state.send_replace(DrainState::Drained);
    }
}

impl Drop for LineMultiplexer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for LineMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineMultiplexer")
            .field("state", &self.state())
            .field("subscribers", &self.shared.subscribers)
            .finish()
    }
}

/// Stand-in for a stream that was not redirected
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLineMultiplexer;

#[async_trait]
impl LineEvents for NullLineMultiplexer {
    fn subscribe(&self, _handler: LineHandler) -> SubscriptionId {
        SubscriptionId::NONE
    }

    fn unsubscribe(&self, _id: SubscriptionId) -> bool {
        false
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn wait_for_all(&self, _timeout: Duration) -> bool {
        true
    }

    fn is_drained(&self) -> bool {
        true
    }

    fn dispose(&self) {}
}
