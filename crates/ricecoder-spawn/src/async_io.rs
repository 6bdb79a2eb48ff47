//! Event-driven access to a process's redirected output
//!
//! [`AsyncProcessIo`] layers one [`LineEvents`] multiplexer over each of the
//! output and error streams of a [`ProcessIo`]. Streams that were not
//! redirected get a [`NullLineMultiplexer`], so subscribing and waiting work
//! the same way whether or not a stream exists.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::events::{LineReceived, SubscriptionId};
use crate::io::{LineReader, LineWriter, ProcessIo};
use crate::multiplexer::{LineEvents, LineMultiplexer, NullLineMultiplexer};
use crate::pipe::StreamKind;

/// Line notifications for the output and error streams of a process
#[derive(Debug)]
pub struct AsyncProcessIo {
    io: ProcessIo,
    output: Box<dyn LineEvents>,
    error: Box<dyn LineEvents>,
}

impl AsyncProcessIo {
    /// Wrap `io`; nothing is read until [`start`](Self::start)
    pub fn new(io: ProcessIo) -> Result<Self> {
        let output = Self::events_for(&io, StreamKind::Output)?;
        let error = Self::events_for(&io, StreamKind::Error)?;
        Ok(Self { io, output, error })
    }

    fn events_for(io: &ProcessIo, kind: StreamKind) -> Result<Box<dyn LineEvents>> {
        if !io.is_redirected(kind) {
            return Ok(Box::new(NullLineMultiplexer));
        }
        let reader: LineReader = io.reader(kind)?;
        Ok(Box::new(LineMultiplexer::new(Arc::new(reader))))
    }

    /// Call `handler` for every line the process writes to stdout
    pub fn on_output_line<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&LineReceived) + Send + Sync + 'static,
    {
        self.output.subscribe(Arc::new(handler))
    }

    /// Call `handler` for every line the process writes to stderr
    pub fn on_error_line<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&LineReceived) + Send + Sync + 'static,
    {
        self.error.subscribe(Arc::new(handler))
    }

    /// Remove an output handler
    pub fn remove_output_handler(&self, id: SubscriptionId) -> bool {
        self.output.unsubscribe(id)
    }

    /// Remove an error handler
    pub fn remove_error_handler(&self, id: SubscriptionId) -> bool {
        self.error.unsubscribe(id)
    }

    /// Start reading both streams. Later calls are no-ops.
    pub fn start(&self) -> Result<()> {
        self.output.start()?;
        self.error.start()?;
        debug!("Started line notifications");
        Ok(())
    }

    /// Wait until stdout reaches end-of-stream; `false` on timeout
    pub async fn wait_for_all_output(&self, timeout: Duration) -> bool {
        self.output.wait_for_all(timeout).await
    }

    /// Wait until stderr reaches end-of-stream; `false` on timeout
    pub async fn wait_for_all_error(&self, timeout: Duration) -> bool {
        self.error.wait_for_all(timeout).await
    }

    /// Writer for the child's stdin
    pub fn input(&self) -> Result<LineWriter> {
        self.io.input()
    }

    /// Direct reader for stdout, bypassing the notifications
    pub fn output(&self) -> Result<LineReader> {
        self.io.output()
    }

    /// Direct reader for stderr, bypassing the notifications
    pub fn error(&self) -> Result<LineReader> {
        self.io.error()
    }

    /// The wrapped streams
    pub fn io(&self) -> &ProcessIo {
        &self.io
    }

    /// Stop both multiplexers and dispose the underlying streams. Idempotent.
    pub fn dispose(&self) {
        self.output.dispose();
        self.error.dispose();
        self.io.dispose();
    }
}
