//! Process configuration

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ProcessError, Result};

/// User and groups the child switches to before it is resumed
///
/// The supplementary group list replaces the parent's entirely; it defaults
/// to just `gid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Numeric user id
    pub uid: u32,
    /// Numeric group id
    pub gid: u32,
    /// Supplementary group ids
    pub groups: Vec<u32>,
}

impl Credentials {
    /// Create credentials from numeric ids, with `gid` as the only
    /// supplementary group
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: vec![gid],
        }
    }

    /// Replace the supplementary group list
    pub fn groups(mut self, groups: impl IntoIterator<Item = u32>) -> Self {
        self.groups = groups.into_iter().collect();
        self
    }
}

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Executable command (PATH lookup when it has no separator)
    pub command: String,
    /// Command arguments
    pub args: Vec<String>,
    /// Working directory (None = current dir)
    pub working_dir: Option<PathBuf>,
    /// Environment variables, in insertion order
    pub env: Vec<(String, String)>,
    /// Start from an empty environment instead of the parent's
    pub env_clear: bool,
    /// Run the child as another user
    pub credentials: Option<Credentials>,
    /// Default bound for [`ManagedChild::wait`](crate::ManagedChild::wait) (None = no timeout)
    pub timeout: Option<Duration>,
    /// Pipe stdin from the parent
    pub redirect_stdin: bool,
    /// Pipe stdout to the parent
    pub redirect_stdout: bool,
    /// Pipe stderr to the parent
    pub redirect_stderr: bool,
    /// Leave the process suspended until [`ManagedChild::start`](crate::ManagedChild::start)
    pub start_suspended: bool,
}

impl ProcessConfig {
    /// Create new process configuration
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: vec![],
            working_dir: None,
            env: vec![],
            env_clear: false,
            credentials: None,
            timeout: None,
            redirect_stdin: false,
            redirect_stdout: false,
            redirect_stderr: false,
            start_suspended: false,
        }
    }

    /// Set command arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Append a single argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add environment variable
    ///
    /// Setting a key twice keeps its original position with the new value.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.env.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.env.push((key, value)),
        }
        self
    }

    /// Do not inherit the parent's environment
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    /// Run the child with the given user and group ids
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set timeout in seconds
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Some(Duration::from_secs(secs));
        self
    }

    /// Set timeout duration
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Enable/disable stdin redirection
    pub fn redirect_stdin(mut self, redirect: bool) -> Self {
        self.redirect_stdin = redirect;
        self
    }

    /// Enable/disable stdout redirection
    pub fn redirect_stdout(mut self, redirect: bool) -> Self {
        self.redirect_stdout = redirect;
        self
    }

    /// Enable/disable stderr redirection
    pub fn redirect_stderr(mut self, redirect: bool) -> Self {
        self.redirect_stderr = redirect;
        self
    }

    /// Redirect all three standard streams
    pub fn redirect_all(self) -> Self {
        self.redirect_stdin(true)
            .redirect_stdout(true)
            .redirect_stderr(true)
    }

    /// Keep the process suspended after creation
    pub fn start_suspended(mut self, suspended: bool) -> Self {
        self.start_suspended = suspended;
        self
    }

    /// Check the configuration before any resource is allocated
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(ProcessError::InvalidConfig(
                "command must not be empty".to_string(),
            ));
        }
        if self.command.contains('\0') {
            return Err(ProcessError::InvalidConfig(
                "command contains a NUL byte".to_string(),
            ));
        }
        if let Some(index) = self.args.iter().position(|a| a.contains('\0')) {
            return Err(ProcessError::InvalidConfig(format!(
                "argument {index} contains a NUL byte"
            )));
        }
        if let Some(dir) = &self.working_dir {
            if dir.as_os_str().is_empty() {
                return Err(ProcessError::InvalidConfig(
                    "working directory must not be empty".to_string(),
                ));
            }
        }
        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(ProcessError::InvalidConfig(format!(
                    "invalid environment variable name: {key:?}"
                )));
            }
            if value.contains('\0') {
                return Err(ProcessError::InvalidConfig(format!(
                    "environment variable {key} contains a NUL byte"
                )));
            }
        }
        Ok(())
    }

    /// The environment the child will see, parent variables first unless
    /// `env_clear` is set
    pub fn merged_env(&self) -> Vec<(OsString, OsString)> {
        let mut merged: Vec<(OsString, OsString)> = if self.env_clear {
            Vec::new()
        } else {
            std::env::vars_os().collect()
        };
        for (key, value) in &self.env {
            let key = OsString::from(key);
            match merged.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = OsString::from(value),
                None => merged.push((key, OsString::from(value))),
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = ProcessConfig::new("cat");
        assert!(!config.redirect_stdin);
        assert!(!config.redirect_stdout);
        assert!(!config.redirect_stderr);
        assert!(!config.start_suspended);
        assert!(config.timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_credentials_default_to_primary_group_only() {
        let credentials = Credentials::new(1000, 100);
        assert_eq!(credentials.groups, vec![100]);

        let credentials = credentials.groups([100, 27]);
        assert_eq!(credentials.groups, vec![100, 27]);
        assert!(Credentials::new(0, 0).groups([]).groups.is_empty());
    }

    #[test]
    fn test_redirect_all() {
        let config = ProcessConfig::new("cat").redirect_all();
        assert!(config.redirect_stdin && config.redirect_stdout && config.redirect_stderr);
    }

    #[test]
    fn test_empty_command_rejected() {
        for command in ["", "   ", "\t"] {
            let err = ProcessConfig::new(command).validate().unwrap_err();
            assert!(matches!(err, ProcessError::InvalidConfig(_)));
        }
    }

    #[test]
    fn test_nul_bytes_rejected() {
        assert!(ProcessConfig::new("ca\0t").validate().is_err());
        assert!(ProcessConfig::new("cat").arg("a\0b").validate().is_err());
        assert!(ProcessConfig::new("cat").env("K", "v\0").validate().is_err());
    }

    #[test]
    fn test_bad_env_key_rejected() {
        assert!(ProcessConfig::new("cat").env("", "v").validate().is_err());
        assert!(ProcessConfig::new("cat").env("A=B", "v").validate().is_err());
    }

    #[test]
    fn test_env_overwrite_keeps_position() {
        let config = ProcessConfig::new("env")
            .env("B", "1")
            .env("A", "2")
            .env("B", "3");
        assert_eq!(
            config.env,
            vec![
                ("B".to_string(), "3".to_string()),
                ("A".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn test_merged_env_clear_contains_only_configured() {
        let config = ProcessConfig::new("env").env_clear().env("ONLY", "me");
        assert_eq!(
            config.merged_env(),
            vec![(OsString::from("ONLY"), OsString::from("me"))]
        );
    }

    #[test]
    fn test_merged_env_overlays_parent() {
        let config = ProcessConfig::new("env").env("PATH", "/nowhere");
        let merged = config.merged_env();
        let paths: Vec<_> = merged.iter().filter(|(k, _)| k == "PATH").collect();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].1, OsString::from("/nowhere"));
    }
}
