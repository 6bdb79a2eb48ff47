//! Managed child process: lifecycle control and exit notification

use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProcessConfig;
use crate::error::{ProcessError, Result};
use crate::events::{ProcessExited, SubscriptionId, Subscribers};
use crate::handle::{ProcessHandle, ProcessHandles, ThreadHandle};
use crate::io::ProcessIo;
use crate::sys::{self, RawProcess, Termination};

/// Background wait on a duplicate of the process handle
#[derive(Debug)]
struct ExitWatch {
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

#[derive(Debug)]
struct ChildInner {
    pid: Pid,
    config: ProcessConfig,
    io: ProcessIo,
    handles: Mutex<Option<ProcessHandles>>,
    exit_code: OnceLock<i32>,
    kill_code: Mutex<Option<i32>>,
    exited: Subscribers<ProcessExited>,
    /// Registration of the exit watch; also serializes the watch against dispose
    watch: Mutex<Option<ExitWatch>>,
    disposed: AtomicBool,
}

impl ChildInner {
    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(ProcessError::Disposed("process"))
        } else {
            Ok(())
        }
    }

    /// Cached exit code, or a fresh non-blocking query that fills the cache
    fn refresh_exit_code(&self) -> Result<Option<i32>> {
        if let Some(code) = self.exit_code.get() {
            return Ok(Some(*code));
        }

        let handles = self.handles.lock();
        let handles = handles.as_ref().ok_or(ProcessError::Disposed("process"))?;
        let Some(termination) = sys::try_exit_status(handles.process.as_fd())? else {
            return Ok(None);
        };

        let code = exit_code_of(termination, *self.kill_code.lock());
        Ok(Some(*self.exit_code.get_or_init(|| code)))
    }

    /// Called by the exit watch once the process handle is signalled
    fn on_exit_signalled(&self) {
        let event = {
            let watch = self.watch.lock();
            if watch.is_none() {
                return;
            }
            match self.refresh_exit_code() {
                Ok(Some(exit_code)) => ProcessExited {
                    pid: self.pid.as_raw().unsigned_abs(),
                    exit_code,
                },
                Ok(None) => {
                    error!(pid = %self.pid, "Process handle signalled without an exit status");
                    return;
                }
                Err(e) => {
                    error!(pid = %self.pid, error = %e, "Failed to read exit code after exit signal");
                    return;
                }
            }
        };

        info!(pid = %self.pid, exit_code = event.exit_code, "Process exited");
        self.exited.dispatch(&event);
    }
}

/// Exit code reported for a termination
///
/// A `SIGKILL` requested through [`ManagedChild::kill`] reports the code that
/// was passed to it; any other signal reports `128 + signo`.
fn exit_code_of(termination: Termination, kill_code: Option<i32>) -> i32 {
    match (termination, kill_code) {
        (Termination::Exited(code), _) => code,
        (Termination::Signaled(Signal::SIGKILL), Some(code)) => code,
        (Termination::Signaled(signal), _) => 128 + signal as i32,
    }
}

/// A `SIGKILL` never yields a normal exit, so one means the process was
/// already gone when it was sent
fn exited_on_its_own(after_kill: Option<Termination>) -> bool {
    matches!(after_kill, Some(Termination::Exited(_)))
}

fn watch_fd(fd: OwnedFd) -> Result<AsyncFd<OwnedFd>> {
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(ProcessError::NoRuntime);
    }
    AsyncFd::with_interest(fd, Interest::READABLE)
        .map_err(|e| ProcessError::from_io("register process wait", &e))
}

/// A child process created by [`ProcessManager`](crate::ProcessManager)
///
/// Owns the native process handle until [`dispose`](Self::dispose) (or drop).
/// A background exit watch caches the exit code and raises
/// [`ProcessExited`] once. Disposing does not terminate the process and does
/// not dispose its [`ProcessIo`].
#[derive(Debug)]
pub struct ManagedChild {
    inner: Arc<ChildInner>,
}

impl ManagedChild {
    pub(crate) fn new(raw: RawProcess, config: ProcessConfig, io: ProcessIo) -> Result<Self> {
        let RawProcess {
            pid,
            pidfd,
            exec_status,
        } = raw;

        let process = ProcessHandle::new(pid, pidfd);
        let watch_handle = process.duplicate();

        let child = Self {
            inner: Arc::new(ChildInner {
                pid,
                config,
                io,
                handles: Mutex::new(Some(ProcessHandles {
                    process,
                    thread: ThreadHandle {
                        suspend_count: 1,
                        exec_status: Some(exec_status),
                    },
                })),
                exit_code: OnceLock::new(),
                kill_code: Mutex::new(None),
                exited: Subscribers::new("process exited"),
                watch: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        };

        match watch_handle.and_then(|handle| watch_fd(handle.into_fd())) {
            Ok(async_fd) => {
                child.register_exit_watch(async_fd);
                Ok(child)
            }
            Err(e) => {
                child.abandon();
                Err(e)
            }
        }
    }

    fn register_exit_watch(&self, async_fd: AsyncFd<OwnedFd>) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak: Weak<ChildInner> = Arc::downgrade(&self.inner);
        let pid = self.inner.pid;

        let mut slot = self.inner.watch.lock();
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                ready = async_fd.readable() => {
                    if let Err(e) = ready {
                        warn!(pid = %pid, error = %e, "Exit watch failed");
                        return;
                    }
                }
            }
            drop(async_fd);

            if let Some(inner) = weak.upgrade() {
                inner.on_exit_signalled();
            }
        });

        *slot = Some(ExitWatch { cancel, _task: task });
        debug!(pid = %pid, "Registered exit watch");
    }

    /// Process ID
    pub fn pid(&self) -> Result<u32> {
        self.inner.ensure_live()?;
        Ok(self.inner.pid.as_raw().unsigned_abs())
    }

    /// Exit code, once the process has exited
    pub fn exit_code(&self) -> Result<Option<i32>> {
        self.inner.ensure_live()?;
        self.inner.refresh_exit_code()
    }

    /// Whether the process has exited
    pub fn has_exited(&self) -> Result<bool> {
        Ok(self.exit_code()?.is_some())
    }

    /// Resume a process created suspended.
    ///
    /// Returns once the program image is running, or with the reason it could
    /// not be executed. A no-op for a process that is already running.
    pub fn start(&self) -> Result<()> {
        self.inner.ensure_live()?;

        let exec_status = {
            let mut handles = self.inner.handles.lock();
            let handles = handles.as_mut().ok_or(ProcessError::Disposed("process"))?;
            let pid = handles.process.pid();

            let mut previous = sys::resume_thread(pid, &mut handles.thread.suspend_count)?;
            while previous > 1 {
                previous = sys::resume_thread(pid, &mut handles.thread.suspend_count)?;
            }
            handles.thread.exec_status.take()
        };

        if let Some(status) = exec_status {
            sys::await_exec(status)?;
            debug!(pid = %self.inner.pid, "Process resumed");
        }
        Ok(())
    }

    /// Terminate the process; `exit_code` becomes its reported exit code.
    ///
    /// Fails with a platform error (`ESRCH`) if the process already exited.
    pub fn kill(&self, exit_code: i32) -> Result<()> {
        self.inner.ensure_live()?;

        let handles = self.inner.handles.lock();
        let handles = handles.as_ref().ok_or(ProcessError::Disposed("process"))?;

        let exited = self.inner.exit_code.get().is_some()
            || sys::try_exit_status(handles.process.as_fd())?.is_some();
        if exited {
            return Err(ProcessError::platform("terminate process", Errno::ESRCH));
        }

        *self.inner.kill_code.lock() = Some(exit_code);
        if let Err(e) = sys::terminate(handles.process.pid()) {
            *self.inner.kill_code.lock() = None;
            return Err(e);
        }

        // kill(2) also succeeds on a zombie that exited since the check above
        let after = sys::try_exit_status(handles.process.as_fd())?;
        if exited_on_its_own(after) {
            *self.inner.kill_code.lock() = None;
            return Err(ProcessError::platform("terminate process", Errno::ESRCH));
        }

        debug!(pid = %self.inner.pid, exit_code, "Terminated process");
        Ok(())
    }

    /// Wait for the process to exit; `None` waits without a bound.
    ///
    /// Returns `false` if `timeout` elapsed first. Waits on its own duplicate
    /// of the process handle, so it can run alongside the exit watch and
    /// other waiters.
    pub async fn wait_for_exit(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.exit_code()?.is_some() {
            return Ok(true);
        }

        let handle = {
            let handles = self.inner.handles.lock();
            let handles = handles.as_ref().ok_or(ProcessError::Disposed("process"))?;
            handles.process.duplicate()?
        };
        let async_fd = watch_fd(handle.into_fd())?;

        let signalled = async { async_fd.readable().await.map(|_| ()) };
        let signalled = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, signalled).await {
                Ok(result) => result,
                Err(_) => return Ok(false),
            },
            None => signalled.await,
        };
        signalled.map_err(|e| ProcessError::from_io("wait for process exit", &e))?;

        match self.exit_code()? {
            Some(_) => Ok(true),
            None => {
                error!(pid = %self.inner.pid, "Process handle signalled without an exit status");
                Err(ProcessError::platform("query exit code", Errno::ECHILD))
            }
        }
    }

    /// Wait for exit within the configured timeout and return the exit code
    pub async fn wait(&self) -> Result<i32> {
        let timeout = self.inner.config.timeout;
        if !self.wait_for_exit(timeout).await? {
            return Err(ProcessError::Timeout {
                millis: timeout.map_or(0, |t| t.as_millis()),
            });
        }
        self.exit_code()?
            .ok_or(ProcessError::platform("query exit code", Errno::ECHILD))
    }

    /// Subscribe to the exit notification.
    ///
    /// Fires once, from the exit watch. Subscribing after the process has
    /// exited does not replay it.
    pub fn on_exited<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ProcessExited) + Send + Sync + 'static,
    {
        self.inner.exited.subscribe(Arc::new(handler))
    }

    /// Remove an exit handler; returns whether it was registered
    pub fn remove_exited_handler(&self, id: SubscriptionId) -> bool {
        self.inner.exited.unsubscribe(id)
    }

    /// Redirected standard streams
    pub fn io(&self) -> ProcessIo {
        self.inner.io.clone()
    }

    /// Configuration the process was created from
    pub fn config(&self) -> &ProcessConfig {
        &self.inner.config
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Stop the exit watch, then release the process handles. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(watch) = self.inner.watch.lock().take() {
            watch.cancel.cancel();
        }

        let handles = self.inner.handles.lock().take();
        if let Some(handles) = handles {
            let exited = self.inner.exit_code.get().is_some()
                || matches!(sys::try_exit_status(handles.process.as_fd()), Ok(Some(_)));
            handles.release(exited);
        }
        debug!(pid = %self.inner.pid, "Disposed process");
    }

    /// Kill and dispose a process that could not be handed to the caller
    pub(crate) fn abandon(&self) {
        if let Err(e) = self.kill(-1) {
            debug!(pid = %self.inner.pid, error = %e, "Process already gone while abandoning");
        }
        self.dispose();
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        self.dispose();
    }
}
