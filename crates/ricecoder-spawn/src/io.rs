//! Redirected standard streams of a child process
//!
//! [`ProcessIo`] owns up to three [`PipeChannel`]s, one per redirected
//! stream, and exposes their parent endpoints as line-oriented handles:
//! [`LineWriter`] for stdin and [`LineReader`] for stdout/stderr.
//!
//! Accessing a stream that was not redirected fails with
//! [`ProcessError::NotRedirected`]. After [`ProcessIo::dispose`] every
//! access fails with [`ProcessError::Disposed`]; a read that was already
//! pending observes end-of-stream instead of hanging.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ProcessError, Result};
use crate::handle::duplicate_handle;
use crate::multiplexer::LineSource;
use crate::pipe::{PipeChannel, StreamKind};

type PipeWriter = BufWriter<pipe::Sender>;

/// Splits a pipe into lines, decoding each one lossily.
///
/// Bytes of a line that is still incomplete stay in `pending` across calls,
/// so an interrupted read loses nothing.
#[derive(Debug)]
struct PipeLines {
    reader: BufReader<pipe::Receiver>,
    pending: Vec<u8>,
}

impl PipeLines {
    fn new(receiver: pipe::Receiver) -> Self {
        Self {
            reader: BufReader::new(receiver),
            pending: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.reader.read_until(b'\n', &mut self.pending).await?;
        if self.pending.is_empty() {
            return Ok(None);
        }
        let raw = std::mem::take(&mut self.pending);
        Ok(Some(decode_line(&raw)))
    }
}

/// Strip one `\n` or `\r\n` terminator; invalid UTF-8 becomes U+FFFD
fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// Line-oriented reader over the parent end of an output or error pipe.
///
/// Cloning yields another handle to the same stream.
#[derive(Debug, Clone)]
pub struct LineReader {
    kind: StreamKind,
    lines: Arc<tokio::sync::Mutex<Option<PipeLines>>>,
    closed: CancellationToken,
}

impl LineReader {
    fn new(kind: StreamKind, fd: OwnedFd, closed: CancellationToken) -> Result<Self> {
        let receiver = pipe::Receiver::from_owned_fd(fd)
            .map_err(|source| ProcessError::Io { stream: kind, source })?;
        Ok(Self {
            kind,
            lines: Arc::new(tokio::sync::Mutex::new(Some(PipeLines::new(receiver)))),
            closed,
        })
    }

    /// Stream this reader is attached to
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Read the next line, without its terminator.
    ///
    /// Bytes that are not valid UTF-8 are replaced with U+FFFD. Returns `Ok(None)` at end-of-stream, which also happens when the
    /// owning [`ProcessIo`] is disposed while this read is pending.
    pub async fn read_line(&self) -> Result<Option<String>> {
        let mut guard = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(ProcessError::Disposed("process I/O")),
            guard = self.lines.lock() => guard,
        };
        if self.closed.is_cancelled() {
            guard.take();
            return Err(ProcessError::Disposed("process I/O"));
        }
        let Some(lines) = guard.as_mut() else {
            return Err(ProcessError::Disposed("process I/O"));
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                guard.take();
                Ok(None)
            }
            line = lines.next_line() => line.map_err(|source| ProcessError::Io {
                stream: self.kind,
                source,
            }),
        }
    }

    /// Read every remaining line until end-of-stream
    pub async fn read_to_end(&self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        while let Some(line) = self.read_line().await? {
            lines.push(line);
        }
        Ok(lines)
    }

    fn release(&self) {
        if let Ok(mut guard) = self.lines.try_lock() {
            guard.take();
        }
    }
}

#[async_trait]
impl LineSource for LineReader {
    async fn next_line(&self) -> Result<Option<String>> {
        self.read_line().await
    }
}

/// Line-oriented writer over the parent end of the input pipe
#[derive(Debug, Clone)]
pub struct LineWriter {
    writer: Arc<tokio::sync::Mutex<Option<PipeWriter>>>,
    closed: CancellationToken,
}

impl LineWriter {
    fn new(fd: OwnedFd, closed: CancellationToken) -> Result<Self> {
        let sender = pipe::Sender::from_owned_fd(fd).map_err(|source| ProcessError::Io {
            stream: StreamKind::Input,
            source,
        })?;
        Ok(Self {
            writer: Arc::new(tokio::sync::Mutex::new(Some(BufWriter::new(sender)))),
            closed,
        })
    }

    /// Write `line` followed by a newline. Buffered until [`flush`](Self::flush).
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.lock().await?;
        let writer = guard.as_mut().ok_or(ProcessError::Disposed("input stream"))?;

        let written = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            result = async {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await
            } => Some(result),
        };
        Self::finish(&mut guard, written)
    }

    /// Push buffered lines into the pipe
    pub async fn flush(&self) -> Result<()> {
        let mut guard = self.lock().await?;
        let writer = guard.as_mut().ok_or(ProcessError::Disposed("input stream"))?;

        let flushed = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            result = writer.flush() => Some(result),
        };
        Self::finish(&mut guard, flushed)
    }

    /// Flush and close the pipe; the child sees end-of-stream on stdin
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.lock().await?;
        let Some(mut writer) = guard.take() else {
            return Err(ProcessError::Disposed("input stream"));
        };
        let result = writer.shutdown().await;
        drop(writer);
        debug!(stream = %StreamKind::Input, "Closed input stream");
        result.map_err(|source| ProcessError::Io {
            stream: StreamKind::Input,
            source,
        })
    }

    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, Option<PipeWriter>>> {
        let mut guard = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(ProcessError::Disposed("process I/O")),
            guard = self.writer.lock() => guard,
        };
        if self.closed.is_cancelled() {
            guard.take();
            return Err(ProcessError::Disposed("process I/O"));
        }
        Ok(guard)
    }

    /// `None` means dispose interrupted the operation
    fn finish(slot: &mut Option<PipeWriter>, outcome: Option<std::io::Result<()>>) -> Result<()> {
        match outcome {
            Some(result) => result.map_err(|source| ProcessError::Io {
                stream: StreamKind::Input,
                source,
            }),
            None => {
                slot.take();
                Err(ProcessError::Disposed("process I/O"))
            }
        }
    }

    fn release(&self) {
        if let Ok(mut guard) = self.writer.try_lock() {
            guard.take();
        }
    }
}

#[derive(Debug)]
struct IoInner {
    input: Option<LineWriter>,
    output: Option<LineReader>,
    error: Option<LineReader>,
    channels: Mutex<Vec<PipeChannel>>,
    closed: CancellationToken,
}

/// Piped standard streams of one child process.
///
/// Cheap to clone; all clones share the same pipes. Must be created inside
/// a tokio runtime, which drives the pipe I/O.
#[derive(Debug, Clone)]
pub struct ProcessIo {
    inner: Arc<IoInner>,
}

impl ProcessIo {
    /// Allocate pipes for the requested streams
    pub fn new(redirect_input: bool, redirect_output: bool, redirect_error: bool) -> Result<Self> {
        let mut channels = Vec::new();
        for (redirect, kind) in [
            (redirect_input, StreamKind::Input),
            (redirect_output, StreamKind::Output),
            (redirect_error, StreamKind::Error),
        ] {
            if redirect {
                channels.push(PipeChannel::create(kind)?);
            }
        }
        Self::from_channels(channels)
    }

    /// Wrap already allocated pipes
    pub fn from_channels(mut channels: Vec<PipeChannel>) -> Result<Self> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ProcessError::NoRuntime);
        }

        let closed = CancellationToken::new();
        let mut input = None;
        let mut output = None;
        let mut error = None;

        for channel in &mut channels {
            let kind = channel.kind();
            let Some(fd) = channel.take_parent() else {
                continue;
            };
            match kind {
                StreamKind::Input => input = Some(LineWriter::new(fd, closed.clone())?),
                StreamKind::Output => output = Some(LineReader::new(kind, fd, closed.clone())?),
                StreamKind::Error => error = Some(LineReader::new(kind, fd, closed.clone())?),
            }
        }

        Ok(Self {
            inner: Arc::new(IoInner {
                input,
                output,
                error,
                channels: Mutex::new(channels),
                closed,
            }),
        })
    }

    /// A process I/O with no redirected streams
    pub fn null() -> Self {
        Self {
            inner: Arc::new(IoInner {
                input: None,
                output: None,
                error: None,
                channels: Mutex::new(Vec::new()),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Writer for the child's stdin
    pub fn input(&self) -> Result<LineWriter> {
        self.ensure_live()?;
        self.inner
            .input
            .clone()
            .ok_or(ProcessError::NotRedirected(StreamKind::Input))
    }

    /// Reader for the child's stdout
    pub fn output(&self) -> Result<LineReader> {
        self.reader(StreamKind::Output)
    }

    /// Reader for the child's stderr
    pub fn error(&self) -> Result<LineReader> {
        self.reader(StreamKind::Error)
    }

    /// Reader for an output stream
    pub fn reader(&self, kind: StreamKind) -> Result<LineReader> {
        self.ensure_live()?;
        let reader = match kind {
            StreamKind::Output => &self.inner.output,
            StreamKind::Error => &self.inner.error,
            StreamKind::Input => return Err(ProcessError::NotRedirected(kind)),
        };
        reader.clone().ok_or(ProcessError::NotRedirected(kind))
    }

    /// Whether `kind` was redirected
    pub fn is_redirected(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Input => self.inner.input.is_some(),
            StreamKind::Output => self.inner.output.is_some(),
            StreamKind::Error => self.inner.error.is_some(),
        }
    }

    /// Independent copy of the child endpoint for `kind`, for handing to the
    /// process being created. `None` when the stream is not redirected.
    pub fn duplicate_child_endpoint(&self, kind: StreamKind) -> Result<Option<OwnedFd>> {
        self.ensure_live()?;
        let channels = self.inner.channels.lock();
        let Some(channel) = channels.iter().find(|c| c.kind() == kind) else {
            return Ok(None);
        };
        let fd = channel
            .child_endpoint()
            .ok_or(ProcessError::Disposed("child endpoint"))?;
        duplicate_handle(fd).map(Some)
    }

    /// Close the local copies of every child endpoint; safe to call again
    pub fn close_child_endpoints(&self) {
        let mut channels = self.inner.channels.lock();
        for channel in channels.iter_mut() {
            channel.close_child_endpoint();
        }
    }

    /// Release every pipe endpoint; later accesses fail with
    /// [`ProcessError::Disposed`]
    pub fn dispose(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();

        if let Some(input) = &self.inner.input {
            input.release();
        }
        for reader in [&self.inner.output, &self.inner.error].into_iter().flatten() {
            reader.release();
        }
        self.close_child_endpoints();
        debug!("Disposed process I/O");
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(ProcessError::Disposed("process I/O"))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::time::Duration;

    fn child_writer(io: &ProcessIo, kind: StreamKind) -> File {
        let fd = io.duplicate_child_endpoint(kind).unwrap().unwrap();
        io.close_child_endpoints();
        File::from(fd)
    }

    #[tokio::test]
    async fn test_unredirected_streams_fail() {
        let io = ProcessIo::new(false, false, false).unwrap();

        assert!(matches!(io.input(), Err(ProcessError::NotRedirected(StreamKind::Input))));
        assert!(matches!(io.output(), Err(ProcessError::NotRedirected(StreamKind::Output))));
        assert!(matches!(io.error(), Err(ProcessError::NotRedirected(StreamKind::Error))));
    }

    #[tokio::test]
    async fn test_redirected_input_can_be_written() {
        let io = ProcessIo::new(true, false, false).unwrap();
        let fd = io.duplicate_child_endpoint(StreamKind::Input).unwrap().unwrap();
        io.close_child_endpoints();

        let input = io.input().unwrap();
        input.write_line("Input1").await.unwrap();
        input.write_line("Input2").await.unwrap();
        input.close().await.unwrap();

        let mut received = String::new();
        File::from(fd).read_to_string(&mut received).unwrap();
        assert_eq!(received, "Input1\nInput2\n");
    }

    #[tokio::test]
    async fn test_redirected_output_can_be_read() {
        let io = ProcessIo::new(false, true, false).unwrap();
        let mut writer = child_writer(&io, StreamKind::Output);
        writer.write_all(b"Input1\r\nInput2\n").unwrap();
        drop(writer);

        let output = io.output().unwrap();
        assert_eq!(output.read_line().await.unwrap().as_deref(), Some("Input1"));
        assert_eq!(output.read_line().await.unwrap().as_deref(), Some("Input2"));
        assert_eq!(output.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced_and_reading_continues() {
        let io = ProcessIo::new(false, true, false).unwrap();
        let mut writer = child_writer(&io, StreamKind::Output);
        writer.write_all(b"first\ncaf\xe9\n\xff\xfe\r\nlast").unwrap();
        drop(writer);

        let lines = io.output().unwrap().read_to_end().await.unwrap();
        assert_eq!(lines, vec!["first", "caf\u{FFFD}", "\u{FFFD}\u{FFFD}", "last"]);
    }

    #[tokio::test]
    async fn test_cancelled_read_keeps_partial_line() {
        let io = ProcessIo::new(false, true, false).unwrap();
        let mut writer = child_writer(&io, StreamKind::Output);
        let output = io.output().unwrap();

        writer.write_all(b"hel").unwrap();
        writer.flush().unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), output.read_line())
            .await
            .is_err());

        writer.write_all(b"lo\n").unwrap();
        drop(writer);
        assert_eq!(output.read_to_end().await.unwrap(), vec!["hello"]);
    }

    #[test]
    fn test_decode_line_strips_one_terminator() {
        assert_eq!(decode_line(b"a\r\n"), "a");
        assert_eq!(decode_line(b"a\n"), "a");
        assert_eq!(decode_line(b"a\r\r\n"), "a\r");
        assert_eq!(decode_line(b"a"), "a");
        assert_eq!(decode_line(b"\n"), "");
    }

    #[tokio::test]
    async fn test_redirected_error_can_be_read() {
        let io = ProcessIo::new(false, false, true).unwrap();
        let mut writer = child_writer(&io, StreamKind::Error);
        writer.write_all(b"oops\n").unwrap();
        drop(writer);

        assert_eq!(io.error().unwrap().read_to_end().await.unwrap(), vec!["oops"]);
    }

    #[tokio::test]
    async fn test_dispose_fails_later_access() {
        let io = ProcessIo::new(true, true, true).unwrap();
        let input = io.input().unwrap();
        let output = io.output().unwrap();

        io.dispose();
        io.dispose();

        assert!(io.is_disposed());
        assert!(matches!(io.input(), Err(ProcessError::Disposed(_))));
        assert!(matches!(io.output(), Err(ProcessError::Disposed(_))));
        assert!(matches!(io.error(), Err(ProcessError::Disposed(_))));
        assert!(matches!(input.write_line("foo").await, Err(ProcessError::Disposed(_))));
        assert!(matches!(output.read_line().await, Err(ProcessError::Disposed(_))));
    }

    #[tokio::test]
    async fn test_dispose_completes_pending_read() {
        let io = ProcessIo::new(false, true, false).unwrap();
        let _writer = child_writer(&io, StreamKind::Output);
        let output = io.output().unwrap();

        let pending = tokio::spawn(async move { output.read_line().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        io.dispose();

        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("pending read must not hang")
            .unwrap();
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn test_close_child_endpoints_is_idempotent() {
        let io = ProcessIo::new(true, true, true).unwrap();
        io.close_child_endpoints();
        io.close_child_endpoints();
        assert!(matches!(
            io.duplicate_child_endpoint(StreamKind::Output),
            Err(ProcessError::Disposed(_))
        ));
    }

    #[tokio::test]
    async fn test_null_io_has_no_streams() {
        let io = ProcessIo::null();
        for kind in [StreamKind::Input, StreamKind::Output, StreamKind::Error] {
            assert!(!io.is_redirected(kind));
            assert!(io.duplicate_child_endpoint(kind).unwrap().is_none());
        }
    }

    #[test]
    fn test_requires_runtime() {
        assert!(matches!(
            ProcessIo::new(false, true, false),
            Err(ProcessError::NoRuntime)
        ));
    }
}
