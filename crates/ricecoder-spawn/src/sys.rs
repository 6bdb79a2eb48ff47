//! Native primitives: suspended process creation, resume, terminate, exit query
//!
//! The child is created with `fork`. Before replacing its image it wires up
//! its standard descriptors, changes directory, switches credentials, closes
//! every descriptor it was not explicitly given and stops itself with
//! `SIGSTOP`. The parent confirms the stop with `waitpid(WUNTRACED)`, so a
//! returned [`RawProcess`] is always suspended and all setup failures are
//! reported synchronously.
//!
//! Exec failures after resume travel back over a close-on-exec status pipe:
//! end-of-file means the new image is running, eight bytes carry the failing
//! stage and errno.
//!
//! Only async-signal-safe libc calls run between `fork` and `execve`; every
//! allocation happens in the parent beforehand.

#![allow(unsafe_code)]

use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getgroups, pipe2, ForkResult, Gid, Pid};
use tracing::debug;

use crate::config::{Credentials, ProcessConfig};
use crate::error::{ProcessError, Result};

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    /// Exited on its own with a status
    Exited(i32),
    /// Killed by a signal
    Signaled(Signal),
}

/// Step in the child at which setup failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
enum ChildStage {
    Redirect = 1,
    WorkingDir = 2,
    Credentials = 3,
    Exec = 4,
}

impl ChildStage {
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::Redirect),
            2 => Some(Self::WorkingDir),
            3 => Some(Self::Credentials),
            4 => Some(Self::Exec),
            _ => None,
        }
    }

    fn operation(self) -> &'static str {
        match self {
            Self::Redirect => "redirect standard handles",
            Self::WorkingDir => "change working directory",
            Self::Credentials => "switch credentials",
            Self::Exec => "execute program",
        }
    }
}

/// Identity switch for the child, resolved against the parent's groups
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChildCredentials {
    uid: libc::uid_t,
    gid: libc::gid_t,
    /// `None` when the parent already has exactly these supplementary groups
    groups: Option<Vec<libc::gid_t>>,
}

impl ChildCredentials {
    fn resolve(credentials: &Credentials, current: &[Gid]) -> Self {
        let mut wanted = credentials.groups.clone();
        wanted.sort_unstable();
        wanted.dedup();
        let mut have: Vec<libc::gid_t> = current.iter().map(|gid| gid.as_raw()).collect();
        have.sort_unstable();
        have.dedup();

        Self {
            uid: credentials.uid,
            gid: credentials.gid,
            groups: (wanted != have).then(|| credentials.groups.clone()),
        }
    }
}

/// Everything the child needs, prepared before `fork`
pub(crate) struct SpawnRequest {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    working_dir: Option<CString>,
    credentials: Option<ChildCredentials>,
    stdio: [Option<OwnedFd>; 3],
}

impl SpawnRequest {
    /// Build the argument vector and environment block for `program`
    pub(crate) fn build(config: &ProcessConfig, program: &Path) -> Result<Self> {
        let program = c_string(program.as_os_str().as_bytes(), "program path")?;

        let mut argv = Vec::with_capacity(config.args.len() + 1);
        argv.push(c_string(config.command.trim().as_bytes(), "command")?);
        for arg in &config.args {
            argv.push(c_string(arg.as_bytes(), "argument")?);
        }

        let mut envp = Vec::new();
        for (key, value) in config.merged_env() {
            let mut entry = key.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            envp.push(c_string(&entry, "environment entry")?);
        }

        let working_dir = config
            .working_dir
            .as_ref()
            .map(|dir| c_string(dir.as_os_str().as_bytes(), "working directory"))
            .transpose()?;

        let credentials = match &config.credentials {
            Some(credentials) => {
                let current =
                    getgroups().map_err(|e| ProcessError::platform("query supplementary groups", e))?;
                Some(ChildCredentials::resolve(credentials, &current))
            }
            None => None,
        };

        Ok(Self {
            program,
            argv,
            envp,
            working_dir,
            credentials,
            stdio: [None, None, None],
        })
    }

    /// Place `fd` on standard descriptor `target` (0, 1 or 2) in the child
    ///
    /// `fd` is first moved above the standard range, so the `dup2` calls in
    /// the child cannot overwrite an endpoint that is still to be copied.
    pub(crate) fn set_stdio(&mut self, target: RawFd, fd: OwnedFd) -> Result<()> {
        let fd = raise_fd(fd, FIRST_FREE_FD)?;
        if let Some(slot) = usize::try_from(target)
            .ok()
            .and_then(|index| self.stdio.get_mut(index))
        {
            *slot = Some(fd);
        }
        Ok(())
    }
}

/// Lowest descriptor above stdin, stdout and stderr
const FIRST_FREE_FD: RawFd = libc::STDERR_FILENO + 1;

/// Move `fd` to a close-on-exec descriptor numbered at least `min`
fn raise_fd(fd: OwnedFd, min: RawFd) -> Result<OwnedFd> {
    if fd.as_raw_fd() >= min {
        return Ok(fd);
    }
    let raised = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(min))
        .map_err(|e| ProcessError::platform("duplicate handle", e))?;
    // SAFETY: F_DUPFD_CLOEXEC just returned a new descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(raised) })
}

fn c_string(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes)
        .map_err(|_| ProcessError::InvalidConfig(format!("{what} contains a NUL byte")))
}

/// A freshly created, suspended process
#[derive(Debug)]
pub(crate) struct RawProcess {
    pub(crate) pid: Pid,
    pub(crate) pidfd: OwnedFd,
    pub(crate) exec_status: OwnedFd,
}

/// Create the process described by `request`, stopped before exec
pub(crate) fn create_suspended(request: &SpawnRequest) -> Result<RawProcess> {
    let (status_read, status_write) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| ProcessError::platform("create exec status pipe", e))?;
    let status_write = raise_fd(status_write, FIRST_FREE_FD)?;

    let argv = null_terminated(&request.argv);
    let envp = null_terminated(&request.envp);
    let stdio = request
        .stdio
        .each_ref()
        .map(|fd| fd.as_ref().map(AsRawFd::as_raw_fd));

    let image = ChildImage {
        program: &request.program,
        argv: &argv,
        envp: &envp,
        working_dir: request.working_dir.as_deref(),
        credentials: request.credentials.as_ref(),
        stdio,
        status_fd: status_write.as_raw_fd(),
    };

    // SAFETY: the child branch only calls async-signal-safe functions on data
    // prepared above and never returns.
    let pid = match unsafe { fork() }.map_err(|e| ProcessError::platform("create process", e))? {
        ForkResult::Child => unsafe { image.exec() },
        ForkResult::Parent { child } => child,
    };
    drop(status_write);

    wait_for_stop(pid, &status_read)?;

    match pidfd_open(pid) {
        Ok(pidfd) => {
            debug!(pid = %pid, "Created suspended process");
            Ok(RawProcess {
                pid,
                pidfd,
                exec_status: status_read,
            })
        }
        Err(err) => {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
            Err(err)
        }
    }
}

/// Wait until the child either stops itself or dies during setup
fn wait_for_stop(pid: Pid, status_read: &OwnedFd) -> Result<()> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::Stopped(_, _)) => return Ok(()),
            Ok(WaitStatus::Exited(_, _)) | Ok(WaitStatus::Signaled(_, _, _)) => {
                return Err(read_child_failure(status_read)
                    .unwrap_or_else(|| ProcessError::platform("create process", Errno::ECHILD)));
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => {
                let _ = kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
                return Err(ProcessError::platform("create process", e));
            }
        }
    }
}

fn read_child_failure(status_read: &OwnedFd) -> Option<ProcessError> {
    let fd = status_read.try_clone().ok()?;
    let mut report = Vec::with_capacity(8);
    File::from(fd).read_to_end(&mut report).ok()?;
    decode_failure(&report)
}

fn decode_failure(report: &[u8]) -> Option<ProcessError> {
    let stage = i32::from_ne_bytes(report.get(0..4)?.try_into().ok()?);
    let errno = i32::from_ne_bytes(report.get(4..8)?.try_into().ok()?);
    let stage = ChildStage::from_raw(stage)?;
    Some(ProcessError::platform(stage.operation(), Errno::from_raw(errno)))
}

/// Block until the resumed child has replaced its image, or report why it
/// could not
pub(crate) fn await_exec(exec_status: OwnedFd) -> Result<()> {
    let mut report = Vec::with_capacity(8);
    File::from(exec_status)
        .read_to_end(&mut report)
        .map_err(|e| ProcessError::from_io("confirm program start", &e))?;
    match decode_failure(&report) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Resume the suspended thread once; returns the previous suspend count
pub(crate) fn resume_thread(pid: Pid, suspend_count: &mut u32) -> Result<u32> {
    let previous = *suspend_count;
    if previous > 0 {
        kill(pid, Signal::SIGCONT).map_err(|e| ProcessError::platform("resume thread", e))?;
        *suspend_count = previous - 1;
    }
    Ok(previous)
}

/// Request termination
pub(crate) fn terminate(pid: Pid) -> Result<()> {
    kill(pid, Signal::SIGKILL).map_err(|e| ProcessError::platform("terminate process", e))
}

/// Non-blocking, non-reaping exit query
pub(crate) fn try_exit_status(process: BorrowedFd<'_>) -> Result<Option<Termination>> {
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT | WaitPidFlag::WNOHANG;
    loop {
        match waitid(Id::PIDFd(process), flags) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(Some(Termination::Exited(code))),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Ok(Some(Termination::Signaled(signal)))
            }
            Ok(_) => return Ok(None),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ProcessError::platform("query exit code", e)),
        }
    }
}

/// Block until the process has exited and collect it
pub(crate) fn reap(process: BorrowedFd<'_>) -> Result<()> {
    loop {
        match waitid(Id::PIDFd(process), WaitPidFlag::WEXITED) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ProcessError::platform("reap process", e)),
        }
    }
}

pub(crate) fn pidfd_open(pid: Pid) -> Result<OwnedFd> {
    // SAFETY: plain syscall; a non-negative result is a new descriptor we own.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if fd < 0 {
        return Err(ProcessError::platform("open process handle", Errno::last()));
    }
    let fd = RawFd::try_from(fd)
        .map_err(|_| ProcessError::platform("open process handle", Errno::EBADF))?;
    // SAFETY: the kernel just returned this descriptor to us.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Borrowed view of a [`SpawnRequest`] used in the child after `fork`
struct ChildImage<'a> {
    program: &'a CStr,
    argv: &'a [*const libc::c_char],
    envp: &'a [*const libc::c_char],
    working_dir: Option<&'a CStr>,
    credentials: Option<&'a ChildCredentials>,
    stdio: [Option<RawFd>; 3],
    status_fd: RawFd,
}

impl ChildImage<'_> {
    /// Runs in the forked child.
    ///
    /// # Safety
    ///
    /// Must only be called in the child branch of `fork`.
    unsafe fn exec(&self) -> ! {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::pthread_sigmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);

        // Every source descriptor sits above stderr, so no dup2 clobbers one.
        for (target, fd) in (0..).zip(self.stdio.iter()) {
            let Some(fd) = *fd else { continue };
            if libc::dup2(fd, target) < 0 {
                self.fail(ChildStage::Redirect);
            }
        }

        if let Some(dir) = self.working_dir {
            if libc::chdir(dir.as_ptr()) < 0 {
                self.fail(ChildStage::WorkingDir);
            }
        }

        if let Some(credentials) = self.credentials {
            let groups_failed = match &credentials.groups {
                Some(groups) => libc::setgroups(groups.len(), groups.as_ptr()) < 0,
                None => false,
            };
            if groups_failed
                || libc::setgid(credentials.gid) < 0
                || libc::setuid(credentials.uid) < 0
            {
                self.fail(ChildStage::Credentials);
            }
        }

        self.close_inherited();
        libc::raise(libc::SIGSTOP);

        libc::execve(self.program.as_ptr(), self.argv.as_ptr(), self.envp.as_ptr());
        self.fail(ChildStage::Exec)
    }

    /// Close everything above stderr except the status pipe
    unsafe fn close_inherited(&self) {
        let first = libc::STDERR_FILENO + 1;
        if self.status_fd > first {
            libc::syscall(
                libc::SYS_close_range,
                first as libc::c_uint,
                (self.status_fd - 1) as libc::c_uint,
                0 as libc::c_uint,
            );
        }
        libc::syscall(
            libc::SYS_close_range,
            (self.status_fd + 1) as libc::c_uint,
            libc::c_uint::MAX,
            0 as libc::c_uint,
        );
    }

    unsafe fn fail(&self, stage: ChildStage) -> ! {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        let mut report = [0u8; 8];
        report[..4].copy_from_slice(&(stage as i32).to_ne_bytes());
        report[4..].copy_from_slice(&errno.to_ne_bytes());
        libc::write(self.status_fd, report.as_ptr().cast(), report.len());
        libc::_exit(127)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_failure_report() {
        let mut report = Vec::new();
        report.extend_from_slice(&(ChildStage::WorkingDir as i32).to_ne_bytes());
        report.extend_from_slice(&libc::ENOENT.to_ne_bytes());
        let err = decode_failure(&report).unwrap();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert!(err.to_string().starts_with("change working directory failed"));
    }

    #[test]
    fn test_empty_report_means_success() {
        assert!(decode_failure(&[]).is_none());
        assert!(decode_failure(&[1, 0, 0]).is_none());
    }

    #[test]
    fn test_resume_counts_down_to_zero() {
        let mut count = 0;
        // Never suspended: a benign no-op that sends no signal.
        assert_eq!(resume_thread(Pid::from_raw(i32::MAX), &mut count).unwrap(), 0);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_raise_fd_moves_low_descriptor() {
        let (read, _write) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let min = read.as_raw_fd() + 64;

        let raised = raise_fd(read, min).unwrap();
        assert!(raised.as_raw_fd() >= min);
        let flags = fcntl(raised.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_raise_fd_keeps_high_descriptor() {
        let (read, _write) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let raw = read.as_raw_fd();
        assert_eq!(raise_fd(read, FIRST_FREE_FD).unwrap().as_raw_fd(), raw);
    }

    #[test]
    fn test_stdio_endpoints_sit_above_standard_range() {
        let config = ProcessConfig::new("true");
        let mut request = SpawnRequest::build(&config, Path::new("/bin/true")).unwrap();
        let (read, write) = pipe2(OFlag::O_CLOEXEC).unwrap();
        request.set_stdio(0, read).unwrap();
        request.set_stdio(1, write).unwrap();

        for fd in request.stdio.iter().flatten() {
            assert!(fd.as_raw_fd() >= FIRST_FREE_FD);
        }
    }

    #[test]
    fn test_credentials_replace_foreign_groups() {
        let current = [Gid::from_raw(0), Gid::from_raw(4242)];
        let resolved = ChildCredentials::resolve(&Credentials::new(65534, 65534), &current);
        assert_eq!(resolved.groups, Some(vec![65534]));

        let resolved =
            ChildCredentials::resolve(&Credentials::new(1000, 1000).groups([]), &current);
        assert_eq!(resolved.groups, Some(vec![]));
    }

    #[test]
    fn test_credentials_skip_identical_groups() {
        let current = [Gid::from_raw(27), Gid::from_raw(1000)];
        let credentials = Credentials::new(1000, 1000).groups([1000, 27, 1000]);
        assert_eq!(ChildCredentials::resolve(&credentials, &current).groups, None);
    }

    #[test]
    fn test_build_request_places_command_first() {
        let config = ProcessConfig::new("sh").args(["-c", "true"]).env_clear().env("A", "1");
        let request = SpawnRequest::build(&config, Path::new("/bin/sh")).unwrap();
        assert_eq!(request.program.as_bytes(), b"/bin/sh");
        let argv: Vec<_> = request.argv.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(argv, ["sh", "-c", "true"]);
        assert_eq!(request.envp, vec![CString::new("A=1").unwrap()]);
    }
}
