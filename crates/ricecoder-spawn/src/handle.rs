//! Native process and thread handles

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, OnceLock};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{pipe2, read, write, Pid};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{ProcessError, Result};
use crate::sys;

/// Duplicate a handle into an independently owned copy with the same rights.
///
/// The copy is close-on-exec and is released on its own schedule, so it can
/// be handed to another component without risking a double close.
pub fn duplicate_handle(fd: BorrowedFd<'_>) -> Result<OwnedFd> {
    fd.try_clone_to_owned()
        .map_err(|e| ProcessError::from_io("duplicate handle", &e))
}

/// Owned process handle (a pidfd) plus the pid it refers to
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    fd: OwnedFd,
}

impl ProcessHandle {
    pub(crate) fn new(pid: Pid, fd: OwnedFd) -> Self {
        Self { pid, fd }
    }

    /// Process ID
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Duplicate this handle so another component can wait on it
    pub fn duplicate(&self) -> Result<ProcessHandle> {
        Ok(Self {
            pid: self.pid,
            fd: duplicate_handle(self.fd.as_fd())?,
        })
    }

    pub(crate) fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for ProcessHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// State of the child's initial thread of execution
#[derive(Debug)]
pub(crate) struct ThreadHandle {
    /// Outstanding suspensions; the child stops itself once before exec
    pub(crate) suspend_count: u32,
    /// Read end of the exec-status pipe, until exec has been confirmed
    pub(crate) exec_status: Option<OwnedFd>,
}

/// Process and thread handles owned by one [`ManagedChild`](crate::ManagedChild)
#[derive(Debug)]
pub(crate) struct ProcessHandles {
    pub(crate) process: ProcessHandle,
    pub(crate) thread: ThreadHandle,
}

impl ProcessHandles {
    /// Release both handles, reaping the process.
    ///
    /// An exited process is reaped immediately. A live one is handed to the
    /// shared reaper thread, which closes the handle once the process is gone.
    pub(crate) fn release(self, exited: bool) {
        let Self { process, thread } = self;
        drop(thread);

        let pid = process.pid();
        if exited {
            if let Err(e) = sys::reap(process.as_fd()) {
                debug!(pid = %pid, error = %e, "Failed to reap exited process");
            }
            return;
        }

        match Reaper::shared() {
            Some(reaper) => reaper.watch(process),
            None => debug!(pid = %pid, "No reaper available, process left unreaped"),
        }
    }
}

/// One background thread that reaps every released, still running process.
///
/// Handles queue up in `pending`; a byte on the wake pipe makes the thread
/// pick them up. It polls all pidfds at once and reaps each as it exits.
#[derive(Debug)]
struct Reaper {
    pending: Arc<Mutex<Vec<ProcessHandle>>>,
    wake: OwnedFd,
}

impl Reaper {
    fn shared() -> Option<&'static Reaper> {
        static REAPER: OnceLock<Option<Reaper>> = OnceLock::new();
        REAPER
            .get_or_init(|| match Self::start() {
                Ok(reaper) => Some(reaper),
                Err(e) => {
                    warn!(error = %e, "Failed to start reaper thread");
                    None
                }
            })
            .as_ref()
    }

    fn start() -> Result<Self> {
        let (wake_read, wake) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
            .map_err(|e| ProcessError::platform("create reaper wake pipe", e))?;
        let pending = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::clone(&pending);

        std::thread::Builder::new()
            .name("process-reaper".to_string())
            .spawn(move || Self::run(&queue, &wake_read))
            .map_err(|e| ProcessError::from_io("start reaper thread", &e))?;
        Ok(Self { pending, wake })
    }

    fn watch(&self, process: ProcessHandle) {
        let pid = process.pid();
        self.pending.lock().push(process);
        if let Err(e) = write(&self.wake, &[1]) {
            // A full pipe already has a wake-up queued
            if e != Errno::EAGAIN {
                warn!(pid = %pid, error = %e, "Failed to wake reaper");
            }
        }
        debug!(pid = %pid, "Handed process to reaper");
    }

    fn run(pending: &Mutex<Vec<ProcessHandle>>, wake: &OwnedFd) {
        let mut watched: Vec<ProcessHandle> = Vec::new();
        loop {
            watched.append(&mut pending.lock());

            let exited: Vec<bool> = {
                let mut fds: Vec<PollFd<'_>> = std::iter::once(wake.as_fd())
                    .chain(watched.iter().map(AsFd::as_fd))
                    .map(|fd| PollFd::new(fd, PollFlags::POLLIN))
                    .collect();
                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) | Err(Errno::EINTR) => {}
                    Err(e) => {
                        warn!(error = %e, watched = watched.len(), "Reaper poll failed, stopping");
                        return;
                    }
                }
                fds.iter()
                    .skip(1)
                    .map(|fd| fd.revents().is_some_and(|events| !events.is_empty()))
                    .collect()
            };

            Self::drain_wake(wake);

            let mut ready = exited.into_iter();
            watched.retain(|process| {
                if !ready.next().unwrap_or(false) {
                    return true;
                }
                if let Err(e) = sys::reap(process.as_fd()) {
                    debug!(pid = %process.pid(), error = %e, "Failed to reap process");
                } else {
                    debug!(pid = %process.pid(), "Reaped process");
                }
                false
            });
        }
    }

    fn drain_wake(wake: &OwnedFd) {
        let mut buf = [0u8; 64];
        while matches!(read(wake.as_raw_fd(), &mut buf), Ok(n) if n > 0) {}
    }
}
