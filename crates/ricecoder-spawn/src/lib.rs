//! # ricecoder-spawn
//!
//! **Purpose**: Child process lifecycle control with line-oriented piped stdio
//!
//! Creates a child process suspended, resumes it explicitly or right away,
//! terminates it with a caller-chosen exit code and reports its exit both by
//! waiting and as a one-shot event. Redirected stdin/stdout/stderr are
//! exposed as line writers and readers, and stdout/stderr can also be
//! consumed as ordered line notifications.
//!
//! ## Features
//!
//! - **Suspended Creation**: Setup failures (working directory, credentials,
//!   missing program) are reported before the program runs
//! - **Exit Watch**: Exit code cached once, `Exited` event raised once
//! - **Kill With Exit Code**: `kill(-8)` reports `-8` as the exit code
//! - **Piped Stdio**: Only the designated pipe endpoints are inherited
//! - **Line Notifications**: Per-stream ordering, panicking subscribers are
//!   isolated from each other and from the reader
//! - **Idempotent Teardown**: `dispose` can be called any number of times
//!
//! Linux only: process handles are pidfds.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ricecoder_spawn::{AsyncProcessIo, ProcessConfig, ProcessManager};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ProcessManager::new();
//!
//! // Configure process
//! let config = ProcessConfig::new("sh")
//!     .args(["-c", "echo hello; echo oops >&2; exit 3"])
//!     .redirect_stdout(true)
//!     .redirect_stderr(true)
//!     .start_suspended(true);
//!
//! let child = manager.spawn(config).await?;
//! child.on_exited(|e| println!("{} exited with {}", e.pid, e.exit_code));
//!
//! // Subscribe before the process runs so no line is missed
//! let io = AsyncProcessIo::new(child.io())?;
//! io.on_output_line(|e| println!("out: {}", e.line()));
//! io.on_error_line(|e| println!("err: {}", e.line()));
//! io.start()?;
//! child.start()?;
//!
//! child.wait_for_exit(None).await?;
//! io.wait_for_all_output(Duration::from_secs(5)).await;
//! assert_eq!(child.exit_code()?, Some(3));
//! # Ok(())
//! # }
//! ```

#![cfg(target_os = "linux")]

pub mod async_io;
pub mod child;
pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod io;
pub mod manager;
pub mod multiplexer;
pub mod pipe;
mod sys;

pub use async_io::AsyncProcessIo;
pub use child::ManagedChild;
pub use config::{Credentials, ProcessConfig};
pub use error::{ProcessError, Result};
pub use events::{LineHandler, LineReceived, ProcessExited, SubscriptionId};
pub use handle::{duplicate_handle, ProcessHandle};
pub use io::{LineReader, LineWriter, ProcessIo};
pub use manager::ProcessManager;
pub use multiplexer::{DrainState, LineEvents, LineMultiplexer, LineSource, NullLineMultiplexer};
pub use pipe::{PipeChannel, StreamKind};
