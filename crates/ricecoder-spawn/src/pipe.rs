//! Anonymous pipes connecting the parent to a child's standard streams

use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tracing::debug;

use crate::error::{ProcessError, Result};

/// One of the three standard streams of a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// stdin, written by the parent
    Input,
    /// stdout, read by the parent
    Output,
    /// stderr, read by the parent
    Error,
}

impl StreamKind {
    /// File descriptor the child sees this stream on
    pub fn child_fd(self) -> RawFd {
        match self {
            Self::Input => 0,
            Self::Output => 1,
            Self::Error => 2,
        }
    }

    /// Whether the parent writes (rather than reads) this stream
    pub fn is_parent_writable(self) -> bool {
        matches!(self, Self::Input)
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Error => "error",
        })
    }
}

/// A connected pipe for one redirected stream.
///
/// The child endpoint is handed to the new process (it lands on fd 0, 1 or 2
/// there); the parent endpoint is kept and wrapped as a line writer or reader.
/// Both ends are close-on-exec, so only the endpoint placed on a standard
/// descriptor survives into the child program.
///
/// Once the child exists, the parent must drop its own copy of the child
/// endpoint with [`close_child_endpoint`](Self::close_child_endpoint).
/// Otherwise a reader on the parent endpoint never sees end-of-stream, since
/// the parent's copy keeps the write side open after the child exits.
#[derive(Debug)]
pub struct PipeChannel {
    kind: StreamKind,
    child: Option<OwnedFd>,
    parent: Option<OwnedFd>,
}

impl PipeChannel {
    /// Allocate a pipe for the given stream
    pub fn create(kind: StreamKind) -> Result<Self> {
        let (read_end, write_end) =
            pipe2(OFlag::O_CLOEXEC).map_err(|e| ProcessError::platform("create pipe", e))?;

        let (child, parent) = if kind.is_parent_writable() {
            (read_end, write_end)
        } else {
            (write_end, read_end)
        };

        debug!(stream = %kind, "Allocated pipe");

        Ok(Self {
            kind,
            child: Some(child),
            parent: Some(parent),
        })
    }

    /// Stream this pipe serves
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// The endpoint meant for the child, until it is closed locally
    pub fn child_endpoint(&self) -> Option<BorrowedFd<'_>> {
        self.child.as_ref().map(AsFd::as_fd)
    }

    /// Close the parent's copy of the child endpoint.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close_child_endpoint(&mut self) -> bool {
        match self.child.take() {
            Some(fd) => {
                drop(fd);
                debug!(stream = %self.kind, "Closed local copy of child endpoint");
                true
            }
            None => false,
        }
    }

    /// Whether the local copy of the child endpoint has been closed
    pub fn is_child_endpoint_closed(&self) -> bool {
        self.child.is_none()
    }

    /// Take ownership of the parent endpoint
    pub(crate) fn take_parent(&mut self) -> Option<OwnedFd> {
        self.parent.take()
    }
}
