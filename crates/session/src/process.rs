//! Child process spawning and stream wiring.
//!
//! A [`Session`] wraps one child process. Spawning attaches pipes to all three
//! standard streams and starts three tasks: one reader per output stream and
//! a supervisor that waits for the child, waits for both readers to reach
//! end-of-stream, then emits the exit exactly once.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::event::{ExitStatus, SessionEvent, SessionEvents, SessionState, StreamKind};

/// Unique identifier for a session.
pub type SessionId = String;

/// Buffer size for reading from the child's pipes.
const READ_BUFFER_SIZE: usize = 4096;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

type ChunkHandler = Box<dyn FnMut(&[u8]) + Send + 'static>;
type ExitHandler = Box<dyn FnOnce(ExitStatus) + Send + 'static>;

/// Signals a session can deliver to its child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Ask the process to exit (SIGTERM).
    Terminate,
    /// Force the process to exit (SIGKILL).
    Kill,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminate => f.write_str("SIGTERM"),
            Self::Kill => f.write_str("SIGKILL"),
        }
    }
}

struct SignalRequest {
    signal: StopSignal,
    reply: oneshot::Sender<Result<()>>,
}

/// Where chunks of one output stream go.
enum OutputSink {
    Channel(mpsc::Sender<SessionEvent>),
    Handler(ChunkHandler),
}

impl OutputSink {
    async fn deliver(&mut self, kind: StreamKind, chunk: &[u8]) {
        match self {
            Self::Channel(tx) => {
                // A dropped receiver only means nobody listens; keep draining
                // the pipe so the child never blocks on a full buffer.
                if tx.send(SessionEvent::Output(kind, chunk.to_vec())).await.is_err() {
                    tracing::trace!(stream = %kind, "No receiver for output");
                }
            }
            Self::Handler(handler) => handler(chunk),
        }
    }
}

/// Where the exit status goes.
enum ExitSink {
    Channel(mpsc::Sender<SessionEvent>),
    Handler(ExitHandler),
}

impl ExitSink {
    async fn deliver(self, status: ExitStatus) {
        match self {
            Self::Channel(tx) => {
                if tx.send(SessionEvent::Exit(status)).await.is_err() {
                    tracing::trace!("No receiver for exit event");
                }
            }
            Self::Handler(handler) => handler(status),
        }
    }
}

/// Builder for a [`Session`].
///
/// Callbacks must be registered before spawning so no chunk can be missed.
/// Streams without a callback are delivered through [`SessionEvents`].
pub struct SessionBuilder {
    program: String,
    args: Vec<String>,
    env: HashMap<OsString, OsString>,
    cwd: Option<PathBuf>,
    event_capacity: usize,
    kill_on_drop: bool,
    on_stdout: Option<ChunkHandler>,
    on_stderr: Option<ChunkHandler>,
    on_exit: Option<ExitHandler>,
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("cwd", &self.cwd)
            .field("event_capacity", &self.event_capacity)
            .field("kill_on_drop", &self.kill_on_drop)
            .finish_non_exhaustive()
    }
}

impl SessionBuilder {
    /// Creates a builder for the given executable.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            kill_on_drop: false,
            on_stdout: None,
            on_stderr: None,
            on_exit: None,
        }
    }

    /// Appends one argument. Arguments are passed to the child verbatim.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the child. The parent environment is
    /// inherited.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory of the child.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Sets the capacity of the event channel. Zero is treated as one.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Kill the child when the [`Session`] handle is dropped while it runs.
    ///
    /// Without this, dropping the handle only closes the child's stdin.
    pub fn kill_on_drop(mut self, kill: bool) -> Self {
        self.kill_on_drop = kill;
        self
    }

    /// Registers a callback for every stdout chunk, called in arrival order.
    ///
    /// The callback runs on the runtime, keep it short and non-blocking.
    pub fn on_stdout<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.on_stdout = Some(Box::new(handler));
        self
    }

    /// Registers a callback for every stderr chunk, called in arrival order.
    pub fn on_stderr<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.on_stderr = Some(Box::new(handler));
        self
    }

    /// Registers a callback invoked once, after both output streams are
    /// drained, with the exit status.
    pub fn on_exit<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(ExitStatus) + Send + 'static,
    {
        self.on_exit = Some(Box::new(handler));
        self
    }

    /// Spawns the child process.
    ///
    /// Returns immediately; the child runs concurrently. Must be called from
    /// within a tokio runtime.
    ///
    /// # Errors
    /// [`SessionError::Spawn`] if the executable is missing, not executable,
    /// or the OS refuses to create the process.
    pub fn spawn(self) -> Result<(Session, SessionEvents)> {
        let id = Uuid::new_v4().to_string();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| SessionError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or(SessionError::StreamUnavailable("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SessionError::StreamUnavailable("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SessionError::StreamUnavailable("stderr"))?;

        let (event_tx, event_rx) = mpsc::channel(self.event_capacity);
        let (state_tx, state_rx) = watch::channel(SessionState::Running);
        let (control_tx, control_rx) = mpsc::channel(4);
        let stdin = Arc::new(Mutex::new(Some(stdin)));

        let stdout_sink = match self.on_stdout {
            Some(handler) => OutputSink::Handler(handler),
            None => OutputSink::Channel(event_tx.clone()),
        };
        let stderr_sink = match self.on_stderr {
            Some(handler) => OutputSink::Handler(handler),
            None => OutputSink::Channel(event_tx.clone()),
        };
        let exit_sink = match self.on_exit {
            Some(handler) => ExitSink::Handler(handler),
            None => ExitSink::Channel(event_tx),
        };

        let readers = [
            tokio::spawn(pump(stdout, StreamKind::Stdout, stdout_sink, id.clone())),
            tokio::spawn(pump(stderr, StreamKind::Stderr, stderr_sink, id.clone())),
        ];

        tokio::spawn(
            Supervisor {
                id: id.clone(),
                pid,
                child,
                readers,
                control_rx,
                exit_sink,
                state_tx,
                stdin: Arc::clone(&stdin),
                kill_on_drop: self.kill_on_drop,
            }
            .run(),
        );

        tracing::info!(
            session_id = %id,
            program = %self.program,
            args = ?self.args,
            pid = ?pid,
            "Spawned session"
        );

        let session = Session {
            id,
            program: self.program,
            args: self.args,
            pid,
            stdin,
            state_rx,
            control_tx,
        };

        Ok((session, SessionEvents::new(event_rx)))
    }
}

/// A running (or finished) child process with attached standard streams.
///
/// The session is owned by the context that spawned it. Dropping the handle
/// closes the child's stdin; the child keeps running unless the builder set
/// [`SessionBuilder::kill_on_drop`].
pub struct Session {
    /// Unique session identifier.
    id: SessionId,

    /// Executable that was launched.
    program: String,

    /// Arguments passed to the executable.
    args: Vec<String>,

    /// Process ID, if the OS reported one.
    pid: Option<u32>,

    /// The child's stdin; `None` once closed.
    stdin: Arc<Mutex<Option<ChildStdin>>>,

    /// Lifecycle state published by the supervisor.
    state_rx: watch::Receiver<SessionState>,

    /// Signal requests for the supervisor.
    control_tx: mpsc::Sender<SignalRequest>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("program", &self.program)
            .field("args", &self.args)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Spawns `program` with `args` and no callbacks.
    ///
    /// All output and the exit are delivered through the returned
    /// [`SessionEvents`].
    pub fn spawn<I, S>(program: impl Into<String>, args: I) -> Result<(Self, SessionEvents)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SessionBuilder::new(program).args(args).spawn()
    }

    /// Starts building a session for `program`.
    pub fn builder(program: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(program)
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the executable that was launched.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the arguments the executable was launched with.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Returns the process ID of the child, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Returns whether the child is still running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), SessionState::Running)
    }

    /// Returns the exit status once the child has exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.state().exit_status()
    }

    /// Writes data to the child's stdin.
    ///
    /// Writes are applied in call order and flushed before returning.
    ///
    /// # Errors
    /// [`SessionError::AlreadyTerminated`] after the child exited,
    /// [`SessionError::InputClosed`] after [`Session::close_input`] or once
    /// the child closed its end of the pipe.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| SessionError::InputClosed(self.id.clone()))?;

        let result = match pipe.write_all(data).await {
            Ok(()) => pipe.flush().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::debug!(session_id = %self.id, bytes = data.len(), "Wrote to session input");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                tracing::debug!(session_id = %self.id, "Child closed its input");
                *stdin = None;
                Err(SessionError::InputClosed(self.id.clone()))
            }
            Err(e) => Err(SessionError::WriteFailed(e)),
        }
    }

    /// Writes `line` to the child's stdin, appending a newline if missing.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        if line.ends_with('\n') {
            self.write(line.as_bytes()).await
        } else {
            let mut data = Vec::with_capacity(line.len() + 1);
            data.extend_from_slice(line.as_bytes());
            data.push(b'\n');
            self.write(&data).await
        }
    }

    /// Closes the child's stdin, signalling end-of-input.
    ///
    /// Closing an already closed input is a no-op.
    pub async fn close_input(&self) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        if let Some(mut pipe) = stdin.take() {
            match pipe.shutdown().await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(SessionError::Io(e)),
            }
            tracing::debug!(session_id = %self.id, "Closed session input");
        }
        Ok(())
    }

    /// Returns whether the input sink is still open.
    pub async fn is_input_open(&self) -> bool {
        self.stdin.lock().await.is_some()
    }

    /// Waits until the child process has exited and returns its exit status.
    ///
    /// Resolves as soon as the process is gone, even if output it left in
    /// its pipes has not been consumed yet; the exit event still follows that
    /// output. Can be awaited from several places.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let mut state_rx = self.state_rx.clone();
        let state = state_rx
            .wait_for(|state| state.exit_status().is_some())
            .await
            .map_err(|_| SessionError::SupervisorGone(self.id.clone()))?;

        let status = state.exit_status();
        status.ok_or_else(|| SessionError::SupervisorGone(self.id.clone()))
    }

    /// Sends SIGTERM and waits for the child to exit.
    pub async fn terminate(&self) -> Result<ExitStatus> {
        self.signal(StopSignal::Terminate).await?;
        self.wait().await
    }

    /// Sends SIGKILL and waits for the child to exit.
    pub async fn kill(&self) -> Result<ExitStatus> {
        self.signal(StopSignal::Kill).await?;
        self.wait().await
    }

    /// Sends SIGTERM, then SIGKILL if the child is still running after
    /// `grace`.
    pub async fn shutdown(&self, grace: Duration) -> Result<ExitStatus> {
        self.signal(StopSignal::Terminate).await?;

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(
                    session_id = %self.id,
                    grace_ms = grace.as_millis() as u64,
                    "Session ignored SIGTERM, escalating to SIGKILL"
                );
                match self.signal(StopSignal::Kill).await {
                    Ok(()) | Err(SessionError::AlreadyTerminated(_)) => {}
                    Err(e) => return Err(e),
                }
                self.wait().await
            }
        }
    }

    /// Delivers a signal to the child without waiting for it to exit.
    ///
    /// # Errors
    /// [`SessionError::AlreadyTerminated`] if the child already exited.
    pub async fn signal(&self, signal: StopSignal) -> Result<()> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        tracing::debug!(session_id = %self.id, signal = %signal, "Signalling session");

        let (reply, reply_rx) = oneshot::channel();
        self.control_tx
            .send(SignalRequest { signal, reply })
            .await
            .map_err(|_| SessionError::AlreadyTerminated(self.id.clone()))?;

        // The supervisor drops pending requests once the child has exited.
        reply_rx
            .await
            .map_err(|_| SessionError::AlreadyTerminated(self.id.clone()))?
    }
}

/// Reads one output stream until end-of-stream.
async fn pump<R>(mut reader: R, kind: StreamKind, mut sink: OutputSink, id: SessionId)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                tracing::debug!(session_id = %id, stream = %kind, "Stream reached EOF");
                break;
            }
            Ok(n) => {
                tracing::trace!(session_id = %id, stream = %kind, bytes = n, "Read chunk");
                sink.deliver(kind, &buffer[..n]).await;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(
                    session_id = %id,
                    stream = %kind,
                    error = %e,
                    "Error reading from session stream"
                );
                break;
            }
        }
    }
}

/// Owns the child for its whole life.
struct Supervisor {
    id: SessionId,
    pid: Option<u32>,
    child: Child,
    readers: [JoinHandle<()>; 2],
    control_rx: mpsc::Receiver<SignalRequest>,
    exit_sink: ExitSink,
    state_tx: watch::Sender<SessionState>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    kill_on_drop: bool,
}

impl Supervisor {
    async fn run(mut self) {
        let mut handle_alive = true;

        let wait_result = loop {
            tokio::select! {
                result = self.child.wait() => break result,
                request = self.control_rx.recv(), if handle_alive => match request {
                    Some(SignalRequest { signal, reply }) => {
                        let _ = reply.send(self.deliver(signal));
                    }
                    None => {
                        // Every handle is gone.
                        handle_alive = false;
                        self.stdin.lock().await.take();
                        if self.kill_on_drop {
                            tracing::debug!(session_id = %self.id, "Handle dropped, killing child");
                            if let Err(e) = self.child.start_kill() {
                                tracing::warn!(session_id = %self.id, error = %e, "Failed to kill child");
                            }
                        }
                    }
                },
            }
        };

        // Reject signals that raced with the exit.
        self.control_rx.close();

        let status = match wait_result {
            Ok(status) => ExitStatus::from(status),
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to wait for child");
                ExitStatus::Unknown
            }
        };

        // Waiters resolve here, whether or not the remaining output is consumed.
        self.state_tx.send_replace(SessionState::Exited(status));
        tracing::debug!(session_id = %self.id, status = %status, "Child exited, draining output");

        for reader in self.readers {
            if let Err(e) = reader.await {
                tracing::warn!(session_id = %self.id, error = %e, "Stream reader task failed");
            }
        }

        self.stdin.lock().await.take();

        tracing::info!(session_id = %self.id, status = %status, "Session terminated");

        self.state_tx.send_replace(SessionState::Terminated(status));
        self.exit_sink.deliver(status).await;
    }

    fn deliver(&mut self, signal: StopSignal) -> Result<()> {
        let failed = |reason: String| SessionError::SignalFailed {
            id: self.id.clone(),
            reason,
        };

        match signal {
            StopSignal::Kill => self.child.start_kill().map_err(|e| failed(e.to_string())),
            StopSignal::Terminate => {
                let pid = self
                    .pid
                    .ok_or_else(|| failed("process id unavailable".to_string()))?;
                send_sigterm(pid).map_err(failed)
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> std::result::Result<(), String> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).map_err(|e| e.to_string())?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(|e| e.to_string())
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> std::result::Result<(), String> {
    Err("graceful termination is only supported on unix".to_string())
}
