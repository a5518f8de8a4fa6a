//! Events produced by a running session.
//!
//! Every chunk read from the child's stdout or stderr becomes a
//! [`SessionEvent::Output`], and the end of the process becomes a single
//! [`SessionEvent::Exit`]. Chunks of one stream keep their arrival order.
//! Nothing orders stdout chunks relative to stderr chunks, the two pipes are
//! buffered independently by the OS.

use std::fmt;

use tokio::sync::mpsc;

/// One of the child's output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl StreamKind {
    /// Returns the conventional short name of the stream.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The process exited on its own with a code.
    Exited(i32),
    /// The process was terminated by a signal.
    Signaled(i32),
    /// The OS reported neither a code nor a signal.
    Unknown,
}

impl ExitStatus {
    /// Returns the exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// Returns the signal number, if the process was killed by a signal.
    pub fn signal(&self) -> Option<i32> {
        match self {
            Self::Signaled(signal) => Some(*signal),
            _ => None,
        }
    }

    /// Returns true if the process exited with code 0.
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }

        Self::Unknown
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(signal) => write!(f, "killed by signal {}", signal),
            Self::Unknown => f.write_str("terminated for unknown reason"),
        }
    }
}

/// Observable lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The child is running and its streams are attached.
    Running,
    /// The child exited; output still buffered in its pipes is being drained.
    Exited(ExitStatus),
    /// Both output streams were drained; the exit is reported last.
    Terminated(ExitStatus),
}

impl SessionState {
    /// Returns the exit status once the child has exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match self {
            Self::Running => None,
            Self::Exited(status) | Self::Terminated(status) => Some(*status),
        }
    }
}

/// An event delivered through [`SessionEvents`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chunk of bytes read from stdout or stderr.
    Output(StreamKind, Vec<u8>),
    /// The process ended. Always the last event, emitted once.
    Exit(ExitStatus),
}

/// Everything a session produced, gathered by [`SessionEvents::collect`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    /// Concatenated stdout chunks.
    pub stdout: Vec<u8>,
    /// Concatenated stderr chunks.
    pub stderr: Vec<u8>,
    /// The exit status, unless it was routed to an exit callback.
    pub status: Option<ExitStatus>,
}

/// Receiving side of a session's event channel.
///
/// Streams that have a callback registered on the builder do not appear here.
/// The channel is bounded: if the receiver is not drained the reader tasks
/// stop reading, and the child eventually blocks writing to its pipes.
/// Dropping the receiver is fine, events are then discarded.
#[derive(Debug)]
pub struct SessionEvents {
    rx: mpsc::Receiver<SessionEvent>,
}

impl SessionEvents {
    pub(crate) fn new(rx: mpsc::Receiver<SessionEvent>) -> Self {
        Self { rx }
    }

    /// Receives the next event, or `None` once the session has finished and
    /// every event was delivered.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Drains the channel until the session finishes.
    pub async fn collect(mut self) -> Output {
        let mut output = Output::default();
        while let Some(event) = self.rx.recv().await {
            match event {
                SessionEvent::Output(StreamKind::Stdout, chunk) => {
                    output.stdout.extend_from_slice(&chunk)
                }
                SessionEvent::Output(StreamKind::Stderr, chunk) => {
                    output.stderr.extend_from_slice(&chunk)
                }
                SessionEvent::Exit(status) => output.status = Some(status),
            }
        }
        output
    }

    /// Returns the underlying tokio receiver.
    pub fn into_inner(self) -> mpsc::Receiver<SessionEvent> {
        self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_accessors() {
        assert_eq!(ExitStatus::Exited(3).code(), Some(3));
        assert_eq!(ExitStatus::Exited(3).signal(), None);
        assert_eq!(ExitStatus::Signaled(9).signal(), Some(9));
        assert_eq!(ExitStatus::Signaled(9).code(), None);
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Exited(1).success());
        assert!(!ExitStatus::Signaled(15).success());
        assert!(!ExitStatus::Unknown.success());
    }

    #[test]
    fn test_exit_status_display() {
        assert_eq!(ExitStatus::Exited(1).to_string(), "exited with code 1");
        assert_eq!(ExitStatus::Signaled(15).to_string(), "killed by signal 15");
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_status_from_std() {
        use std::os::unix::process::ExitStatusExt;

        // Raw wait statuses: code in the high byte, signal in the low bits.
        let exited = std::process::ExitStatus::from_raw(2 << 8);
        assert_eq!(ExitStatus::from(exited), ExitStatus::Exited(2));

        let signaled = std::process::ExitStatus::from_raw(9);
        assert_eq!(ExitStatus::from(signaled), ExitStatus::Signaled(9));
    }

    #[test]
    fn test_session_state_exit_status() {
        assert_eq!(SessionState::Running.exit_status(), None);
        assert_eq!(
            SessionState::Exited(ExitStatus::Signaled(9)).exit_status(),
            Some(ExitStatus::Signaled(9))
        );
        assert_eq!(
            SessionState::Terminated(ExitStatus::Exited(0)).exit_status(),
            Some(ExitStatus::Exited(0))
        );
    }

    #[test]
    fn test_stream_kind_names() {
        assert_eq!(StreamKind::Stdout.to_string(), "stdout");
        assert_eq!(StreamKind::Stderr.as_str(), "stderr");
    }

    #[tokio::test]
    async fn test_collect_concatenates_per_stream() {
        let (tx, rx) = mpsc::channel(8);
        let events = SessionEvents::new(rx);

        tx.send(SessionEvent::Output(StreamKind::Stdout, b"hel".to_vec()))
            .await
            .unwrap();
        tx.send(SessionEvent::Output(StreamKind::Stderr, b"oops".to_vec()))
            .await
            .unwrap();
        tx.send(SessionEvent::Output(StreamKind::Stdout, b"lo\n".to_vec()))
            .await
            .unwrap();
        tx.send(SessionEvent::Exit(ExitStatus::Exited(0))).await.unwrap();
        drop(tx);

        let output = events.collect().await;
        assert_eq!(output.stdout, b"hello\n");
        assert_eq!(output.stderr, b"oops");
        assert_eq!(output.status, Some(ExitStatus::Exited(0)));
    }
}
