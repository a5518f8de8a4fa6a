//! One-shot driver for a session.
//!
//! The runner spawns the invocation, writes the configured commands to the
//! child's stdin (optionally followed by lines read from another input),
//! echoes each output line prefixed with its stream name, and reports the
//! exit. An external cancellation triggers SIGTERM, then SIGKILL once the
//! grace period has passed; the exit is still reported.

use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use session::{
    ExitStatus, LineSplitter, Session, SessionError, SessionEvent, StopSignal, StreamKind,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::invocation::Invocation;

/// Line source forwarded to the child after the configured commands.
pub type InputSource = Pin<Box<dyn AsyncBufRead + Send>>;

/// What the runner does with the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Lines written to the child's stdin, in order.
    pub commands: Vec<String>,
    /// Close the child's stdin once all input was written.
    pub close_input: bool,
    /// Time between SIGTERM and SIGKILL after cancellation.
    pub shutdown_grace: Duration,
    /// Capacity of the session's event channel.
    pub event_capacity: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

impl RunOptions {
    /// Builds options from the `[session]` configuration section.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            commands: config.commands.clone(),
            close_input: config.close_input,
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
            event_capacity: config.event_capacity,
        }
    }
}

/// Runs one invocation to completion, echoing its output to `W`.
pub struct Runner<W> {
    invocation: Invocation,
    options: RunOptions,
    out: W,
    input: Option<InputSource>,
    shutdown: CancellationToken,
}

impl<W: Write> Runner<W> {
    /// Creates a runner writing echoed output to `out`.
    pub fn new(invocation: Invocation, options: RunOptions, out: W) -> Self {
        Self {
            invocation,
            options,
            out,
            input: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Forwards lines from `input` to the child after the configured commands.
    pub fn with_input(mut self, input: InputSource) -> Self {
        self.input = Some(input);
        self
    }

    /// Stops the child when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Returns the output writer.
    pub fn into_inner(self) -> W {
        self.out
    }

    /// Spawns the child and drives it until it has exited.
    ///
    /// A non-zero exit code is not an error; it is returned as the status.
    pub async fn run(&mut self) -> Result<ExitStatus> {
        let (session, mut events) = self
            .invocation
            .to_builder()
            .event_capacity(self.options.event_capacity)
            .spawn()
            .with_context(|| format!("Failed to start `{}`", self.invocation))?;

        info!(
            session_id = %session.id(),
            pid = ?session.pid(),
            "Started `{}`",
            self.invocation
        );

        let commands = self.options.commands.clone();
        let feed = feed_input(
            &session,
            &commands,
            self.input.take(),
            self.options.close_input,
        );
        tokio::pin!(feed);
        let mut feed_done = false;

        let mut escalation: Option<Pin<Box<tokio::time::Sleep>>> = None;
        let mut stopping = false;

        let mut stdout_lines = LineSplitter::new();
        let mut stderr_lines = LineSplitter::new();
        let mut exit = None;

        loop {
            tokio::select! {
                _ = &mut feed, if !feed_done => feed_done = true,
                _ = self.shutdown.cancelled(), if !stopping => {
                    stopping = true;
                    info!(session_id = %session.id(), "Stopping session");
                    if signal_ignoring_exit(&session, StopSignal::Terminate).await? {
                        escalation = Some(Box::pin(tokio::time::sleep(self.options.shutdown_grace)));
                    }
                }
                _ = wait_escalation(&mut escalation) => {
                    escalation = None;
                    warn!(session_id = %session.id(), "Grace period elapsed, killing session");
                    signal_ignoring_exit(&session, StopSignal::Kill).await?;
                }
                event = events.recv() => match event {
                    Some(SessionEvent::Output(StreamKind::Stdout, chunk)) => {
                        for line in stdout_lines.push(&chunk) {
                            self.echo(StreamKind::Stdout, &line)?;
                        }
                    }
                    Some(SessionEvent::Output(StreamKind::Stderr, chunk)) => {
                        for line in stderr_lines.push(&chunk) {
                            self.echo(StreamKind::Stderr, &line)?;
                        }
                    }
                    Some(SessionEvent::Exit(status)) => exit = Some(status),
                    None => break,
                },
            }
        }

        if let Some(tail) = stdout_lines.finish() {
            self.echo(StreamKind::Stdout, &tail)?;
        }
        if let Some(tail) = stderr_lines.finish() {
            self.echo(StreamKind::Stderr, &tail)?;
        }

        let status = match exit {
            Some(status) => status,
            None => session.wait().await?,
        };

        writeln!(self.out, "child process {}", status).context("Failed to write output")?;
        self.out.flush().context("Failed to flush output")?;

        info!(session_id = %session.id(), status = %status, "Session finished");
        Ok(status)
    }

    fn echo(&mut self, stream: StreamKind, line: &str) -> Result<()> {
        writeln!(self.out, "{}: {}", stream, line).context("Failed to write output")
    }
}

/// Maps a session exit status onto a process exit code, shell style.
pub fn exit_code(status: ExitStatus) -> i32 {
    match status {
        ExitStatus::Exited(code) => code,
        ExitStatus::Signaled(signal) => 128 + signal,
        ExitStatus::Unknown => 1,
    }
}

/// Writes commands, then forwarded lines, then optionally closes the input.
///
/// Stops quietly once the child no longer accepts input; its exit is
/// reported through the event channel.
async fn feed_input(
    session: &Session,
    commands: &[String],
    input: Option<InputSource>,
    close_input: bool,
) {
    for command in commands {
        if !write_or_report(session, command).await {
            return;
        }
    }

    if let Some(input) = input {
        let mut lines = input.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !write_or_report(session, &line).await {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read forwarded input");
                    break;
                }
            }
        }
    }

    if close_input {
        if let Err(e) = session.close_input().await {
            warn!(session_id = %session.id(), error = %e, "Failed to close session input");
        }
    }
}

async fn write_or_report(session: &Session, line: &str) -> bool {
    match session.write_line(line).await {
        Ok(()) => {
            debug!(session_id = %session.id(), command = %line, "Sent command");
            true
        }
        Err(e) if e.is_write_after_close() => {
            warn!(session_id = %session.id(), command = %line, "Session no longer accepts input");
            false
        }
        Err(e) => {
            warn!(session_id = %session.id(), error = %e, "Failed to send command");
            false
        }
    }
}

/// Sends `signal`; returns false if the session had already exited.
async fn signal_ignoring_exit(session: &Session, signal: StopSignal) -> Result<bool> {
    match session.signal(signal).await {
        Ok(()) => Ok(true),
        Err(SessionError::AlreadyTerminated(_)) => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to send {}", signal)),
    }
}

/// Resolves when the escalation timer fires; pending forever if none is set.
fn wait_escalation(
    escalation: &mut Option<Pin<Box<tokio::time::Sleep>>>,
) -> impl Future<Output = ()> + '_ {
    async move {
        match escalation {
            Some(sleep) => sleep.as_mut().await,
            None => std::future::pending().await,
        }
    }
}
