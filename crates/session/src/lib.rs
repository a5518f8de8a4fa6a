//! # Subprocess Session
//!
//! This crate launches an external program, attaches pipes to its three
//! standard streams and reports its termination.
//!
//! ## Overview
//!
//! - **Spawn**: start a named executable with a fixed argument list
//! - **Output**: stdout and stderr chunks, in arrival order per stream,
//!   through callbacks or an event channel
//! - **Input**: ordered, flushed writes to the child's stdin, and closing it
//! - **Exit**: one exit event with a code or a signal, after both output
//!   streams were drained
//! - **Stop**: SIGTERM, SIGKILL, or SIGTERM with a grace period before SIGKILL
//!
//! ## Lifecycle
//!
//! ```text
//!   spawn ──► Running ──(child exits)──► Exited(status) ──(streams drained)──► Terminated(status)
//!                │                             ▲
//!                └──(terminate / kill / shutdown)
//! ```
//!
//! [`Session::wait`] and the stop operations resolve at `Exited`, so they never
//! depend on the event receiver being read. The exit event is produced at
//! `Terminated`, after the last output chunk.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use session::{Session, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), session::SessionError> {
//!     let (session, mut events) =
//!         Session::spawn("./gcd", ["-c", "../v3.json", "--configtest"])?;
//!
//!     session.write_line("go G0X100Y100").await?;
//!     session.write_line("q").await?;
//!     session.close_input().await?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SessionEvent::Output(stream, chunk) => {
//!                 println!("{}: {}", stream, String::from_utf8_lossy(&chunk));
//!             }
//!             SessionEvent::Exit(status) => println!("child process {}", status),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`process`]: session spawning, stdin, signals
//! - [`event`]: stream kinds, exit status, events
//! - [`lines`]: line splitting for chunked output
//! - [`error`]: error types

pub mod error;
pub mod event;
pub mod lines;
pub mod process;

pub use error::{Result, SessionError};
pub use event::{ExitStatus, Output, SessionEvent, SessionEvents, SessionState, StreamKind};
pub use lines::LineSplitter;
pub use process::{Session, SessionBuilder, SessionId, StopSignal, DEFAULT_EVENT_CAPACITY};
