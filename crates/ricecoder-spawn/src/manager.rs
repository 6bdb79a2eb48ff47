//! Process manager - creation orchestration

use nix::errno::Errno;
use tracing::{debug, info};

use crate::{
    child::ManagedChild,
    config::ProcessConfig,
    error::{ProcessError, Result},
    io::ProcessIo,
    pipe::StreamKind,
    sys::{self, SpawnRequest},
};

/// Creates managed child processes
#[derive(Debug, Clone, Copy)]
pub struct ProcessManager;

impl ProcessManager {
    /// Create new process manager
    pub fn new() -> Self {
        Self
    }

    /// Spawn a managed process
    ///
    /// The process is created suspended with only its redirected pipe
    /// endpoints inherited, and is resumed before this returns unless
    /// [`ProcessConfig::start_suspended`] was set. Every resource allocated
    /// along the way is released again if a later step fails.
    ///
    /// # Arguments
    /// * `config` - Process configuration
    ///
    /// # Returns
    /// Managed child process wrapper
    ///
    /// # Examples
    /// ```no_run
    /// use ricecoder_spawn::{ProcessManager, ProcessConfig};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let manager = ProcessManager::new();
    /// let config = ProcessConfig::new("echo").args(["hello"]).redirect_stdout(true);
    /// let child = manager.spawn(config).await?;
    /// let output = child.io().output()?.read_to_end().await?;
    /// assert_eq!(output, vec!["hello"]);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn spawn(&self, config: ProcessConfig) -> Result<ManagedChild> {
        debug!(
            command = %config.command,
            args = ?config.args,
            "Spawning process"
        );

        config.validate()?;
        let program = which::which(config.command.trim()).map_err(|e| {
            debug!(command = %config.command, error = %e, "Executable not found");
            ProcessError::platform("resolve executable", Errno::ENOENT)
        })?;
        let mut request = SpawnRequest::build(&config, &program)?;

        let io = ProcessIo::new(
            config.redirect_stdin,
            config.redirect_stdout,
            config.redirect_stderr,
        )?;

        let created = Self::attach_stdio(&io, &mut request)
            .and_then(|()| sys::create_suspended(&request));
        let raw = match created {
            Ok(raw) => raw,
            Err(e) => {
                io.dispose();
                return Err(e);
            }
        };
        drop(request);
        io.close_child_endpoints();

        let start = !config.start_suspended;
        let child = match ManagedChild::new(raw, config, io.clone()) {
            Ok(child) => child,
            Err(e) => {
                io.dispose();
                return Err(e);
            }
        };

        if start {
            if let Err(e) = child.start() {
                child.abandon();
                io.dispose();
                return Err(e);
            }
        }

        info!(
            pid = child.pid()?,
            command = %child.config().command,
            suspended = !start,
            "Process spawned"
        );
        Ok(child)
    }

    /// Hand independent copies of the child endpoints to the request
    fn attach_stdio(io: &ProcessIo, request: &mut SpawnRequest) -> Result<()> {
        for kind in [StreamKind::Input, StreamKind::Output, StreamKind::Error] {
            if let Some(fd) = io.duplicate_child_endpoint(kind)? {
                request.set_stdio(kind.child_fd(), fd)?;
            }
        }
        Ok(())
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_echo() {
        let manager = ProcessManager::new();
        let config = ProcessConfig::new("echo").args(["hello"]);

        let child = manager.spawn(config).await.unwrap();
        assert!(child.pid().unwrap() > 0);
        assert!(child.wait_for_exit(None).await.unwrap());
        assert_eq!(child.exit_code().unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_invalid_command_fails_before_allocation() {
        let err = ProcessManager::new()
            .spawn(ProcessConfig::new("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_missing_executable_is_platform_error() {
        let err = ProcessManager::new()
            .spawn(ProcessConfig::new("definitely-not-a-real-program-4711"))
            .await
            .unwrap_err();
        assert!(err.is_platform());
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[tokio::test]
    async fn test_spawn_suspended_then_start() {
        let config = ProcessConfig::new("true").start_suspended(true);
        let child = ProcessManager::new().spawn(config).await.unwrap();

        assert!(!child.wait_for_exit(Some(std::time::Duration::from_millis(200))).await.unwrap());
        assert!(!child.has_exited().unwrap());

        child.start().unwrap();
        assert!(child.wait_for_exit(None).await.unwrap());
        assert_eq!(child.exit_code().unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_bad_working_dir_is_reported() {
        let config = ProcessConfig::new("true").working_dir("/definitely/not/here");
        let err = ProcessManager::new().spawn(config).await.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}
