//! Bidirectional byte relay between a transport session and a protocol
//! subprocess.
//!
//! Client input reaches the child's stdin until the client signals end of
//! input, which closes stdin without touching the child. The exit status is
//! reported only once the child has exited and its stdout has been read to
//! the end. Cancelling the relay kills the child.

use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{Error, Result};

/// Receives what the child produces.
#[async_trait]
pub trait RelaySink: Send + Sync + 'static {
    async fn stdout(&self, data: Bytes) -> Result<()>;
    async fn stderr(&self, data: Bytes) -> Result<()>;
    /// Called once, after stdout is drained and the child has exited.
    async fn exit(&self, code: u32) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Open,
    /// Client input ended; the child may still be writing.
    InputClosed,
    /// Child exited and stdout is drained; exit status not yet delivered.
    OutputDrained,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayEvent {
    InputEof,
    Drained,
    ExitDelivered,
    Cancelled,
}

impl RelayState {
    fn advance(self, event: RelayEvent) -> Self {
        match (self, event) {
            (Self::Closed, _) | (_, RelayEvent::Cancelled) => Self::Closed,
            (Self::Open, RelayEvent::InputEof) => Self::InputClosed,
            (Self::Open | Self::InputClosed, RelayEvent::Drained) => Self::OutputDrained,
            (Self::OutputDrained, RelayEvent::ExitDelivered) => Self::Closed,
            (state, _) => state,
        }
    }
}

#[derive(Clone)]
struct SharedState(Arc<watch::Sender<RelayState>>);

impl SharedState {
    fn get(&self) -> RelayState {
        *self.0.borrow()
    }

    fn apply(&self, event: RelayEvent) -> RelayState {
        self.0.send_modify(|state| *state = state.advance(event));
        self.get()
    }
}

/// A running subprocess wired to a [`RelaySink`]. Dropping the relay kills
/// the child.
pub struct ProcessRelay {
    /// Unbounded so transport callbacks never wait on the child.
    stdin: Option<mpsc::UnboundedSender<Bytes>>,
    cancel: CancellationToken,
    state: SharedState,
    supervisor: JoinHandle<Option<ExitStatus>>,
    _kill_on_drop: DropGuard,
}

impl ProcessRelay {
    /// Spawns `command` and starts relaying. The command must have all three
    /// stdio handles piped.
    pub fn spawn(command: Command, sink: Arc<dyn RelaySink>) -> Result<Self> {
        Self::spawn_with_cancel(command, sink, CancellationToken::new())
    }

    /// Like [`ProcessRelay::spawn`], killing the child when `cancel` fires.
    pub fn spawn_with_cancel(
        mut command: Command,
        sink: Arc<dyn RelaySink>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut child = command.spawn()?;
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(RelayState::Open);
        let state = SharedState(Arc::new(state_tx));

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Git("child stdin not piped".to_string()))?;
        tokio::spawn(feed_stdin(stdin, stdin_rx));

        let supervisor = tokio::spawn(supervise(child, sink, cancel.clone(), state.clone()));

        Ok(Self {
            stdin: Some(stdin_tx),
            _kill_on_drop: cancel.clone().drop_guard(),
            cancel,
            state,
            supervisor,
        })
    }

    /// A handle for feeding the child's stdin without borrowing the relay.
    /// `None` once input is closed.
    #[must_use]
    pub fn input(&self) -> Option<mpsc::UnboundedSender<Bytes>> {
        self.stdin.clone()
    }

    /// Queues client bytes for the child's stdin.
    pub fn write(&self, data: Bytes) -> Result<()> {
        let Some(stdin) = &self.stdin else {
            return Err(Error::BadRequest("input already closed".to_string()));
        };
        stdin
            .send(data)
            .map_err(|_| Error::Io(std::io::ErrorKind::BrokenPipe.into()))
    }

    /// Half-closes the child's stdin once queued input is written.
    pub fn close_input(&mut self) {
        if self.stdin.take().is_some() {
            self.state.apply(RelayEvent::InputEof);
        }
    }

    /// Kills the child. No exit status is reported afterwards.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn state(&self) -> RelayState {
        self.state.get()
    }

    /// Resolves when the relay reaches [`RelayState::Closed`], however it
    /// got there.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.state.0.subscribe();
        async move {
            let _ = state.wait_for(|s| *s == RelayState::Closed).await;
        }
    }

    /// Waits for the relay to finish. Returns the exit status unless the
    /// relay was cancelled.
    pub async fn wait(self) -> Result<Option<ExitStatus>> {
        Ok(self.supervisor.await?)
    }
}

async fn feed_stdin(
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            tracing::debug!("Child stdin closed early: {e}");
            return;
        }
    }
    if let Err(e) = stdin.shutdown().await {
        tracing::debug!("Closing child stdin failed: {e}");
    }
}

async fn pump<R>(reader: R, sink: Arc<dyn RelaySink>, is_stderr: bool) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunks = ReaderStream::new(reader);
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if is_stderr {
            sink.stderr(chunk).await?;
        } else {
            sink.stdout(chunk).await?;
        }
    }
    Ok(())
}

async fn supervise(
    mut child: Child,
    sink: Arc<dyn RelaySink>,
    cancel: CancellationToken,
    state: SharedState,
) -> Option<ExitStatus> {
    let stdout = child.stdout.take().map(|out| tokio::spawn(pump(out, Arc::clone(&sink), false)));
    let stderr = child.stderr.take().map(|err| tokio::spawn(pump(err, Arc::clone(&sink), true)));

    let finished = async {
        let status = child.wait().await;
        for handle in [stdout, stderr].into_iter().flatten() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("Relay output stopped: {e}"),
                Err(e) => tracing::warn!("Relay output task failed: {e}"),
            }
        }
        status
    };

    let outcome = tokio::select! {
        () = cancel.cancelled() => None,
        status = finished => Some(status),
    };

    let status = match outcome {
        Some(Ok(status)) => status,
        Some(Err(e)) => {
            tracing::warn!("Waiting on child failed: {e}");
            state.apply(RelayEvent::Cancelled);
            return None;
        }
        None => {
            if let Err(e) = child.kill().await {
                tracing::debug!("Killing child failed: {e}");
            }
            state.apply(RelayEvent::Cancelled);
            return None;
        }
    };

    state.apply(RelayEvent::Drained);
    let code = status.code().and_then(|c| u32::try_from(c).ok()).unwrap_or(1);
    if let Err(e) = sink.exit(code).await {
        tracing::debug!("Delivering exit status failed: {e}");
    }
    state.apply(RelayEvent::ExitDelivered);
    Some(status)
}

#[cfg(test)]
mod tests {
    use std::process::Stdio;
    use std::time::Duration;

    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    #[derive(Default)]
    struct Collector {
        stdout: AsyncMutex<Vec<u8>>,
        stderr: AsyncMutex<Vec<u8>>,
        exits: AsyncMutex<Vec<u32>>,
    }

    #[async_trait]
    impl RelaySink for Collector {
        async fn stdout(&self, data: Bytes) -> Result<()> {
            self.stdout.lock().await.extend_from_slice(&data);
            Ok(())
        }

        async fn stderr(&self, data: Bytes) -> Result<()> {
            self.stderr.lock().await.extend_from_slice(&data);
            Ok(())
        }

        async fn exit(&self, code: u32) -> Result<()> {
            // Exit must never overtake stdout.
            assert!(!self.stdout.lock().await.is_empty() || code != 0);
            self.exits.lock().await.push(code);
            Ok(())
        }
    }

    fn piped(program: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    #[test]
    fn test_state_transitions() {
        use RelayEvent::*;
        use RelayState::*;

        assert_eq!(Open.advance(InputEof), InputClosed);
        assert_eq!(InputClosed.advance(Drained), OutputDrained);
        assert_eq!(OutputDrained.advance(ExitDelivered), Closed);

        // The child may finish before the client ends its input.
        assert_eq!(Open.advance(Drained), OutputDrained);
        assert_eq!(OutputDrained.advance(InputEof), OutputDrained);

        for state in [Open, InputClosed, OutputDrained, Closed] {
            assert_eq!(state.advance(Cancelled), Closed);
        }
        assert_eq!(Closed.advance(InputEof), Closed);
        assert_eq!(Open.advance(ExitDelivered), Open);
    }

    #[tokio::test]
    async fn test_half_close_drains_before_exit() {
        let sink = Arc::new(Collector::default());
        let mut relay = ProcessRelay::spawn(piped("cat", &[]), sink.clone()).unwrap();

        relay.write(Bytes::from_static(b"hello ")).unwrap();
        relay.write(Bytes::from_static(b"world")).unwrap();
        relay.close_input();
        assert_ne!(relay.state(), RelayState::Open);
        assert!(relay.write(Bytes::from_static(b"late")).is_err());

        let status = relay.wait().await.unwrap().unwrap();
        assert!(status.success());
        assert_eq!(sink.stdout.lock().await.as_slice(), b"hello world");
        assert_eq!(sink.exits.lock().await.as_slice(), &[0]);
    }

    #[tokio::test]
    async fn test_stderr_and_exit_code() {
        let sink = Arc::new(Collector::default());
        let mut relay = ProcessRelay::spawn(
            piped("sh", &["-c", "echo out; echo err >&2; exit 3"]),
            sink.clone(),
        )
        .unwrap();
        relay.close_input();

        relay.wait().await.unwrap().unwrap();
        assert_eq!(sink.stdout.lock().await.as_slice(), b"out\n");
        assert_eq!(sink.stderr.lock().await.as_slice(), b"err\n");
        assert_eq!(sink.exits.lock().await.as_slice(), &[3]);
    }

    #[tokio::test]
    async fn test_write_never_waits_on_child() {
        let sink = Arc::new(Collector::default());
        let relay = ProcessRelay::spawn(piped("sleep", &["30"]), sink.clone()).unwrap();

        // The child never reads stdin; queueing input must still not block.
        for _ in 0..1024 {
            relay.write(Bytes::from(vec![b'x'; 1024])).unwrap();
        }
        assert_eq!(relay.state(), RelayState::Open);

        relay.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), relay.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let sink = Arc::new(Collector::default());
        let relay = ProcessRelay::spawn(piped("sleep", &["30"]), sink.clone()).unwrap();
        let closed = relay.closed();

        relay.cancel();
        tokio::time::timeout(Duration::from_secs(5), closed).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), relay.wait())
            .await
            .unwrap()
            .unwrap();

        assert!(outcome.is_none());
        assert!(sink.exits.lock().await.is_empty());
    }
}
