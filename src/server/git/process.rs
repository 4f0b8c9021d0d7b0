use std::io;
use std::pin::Pin;
use std::process::ExitStatus;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{Error, Result};

/// Child stdout as a response body stream. Dropping the stream before it
/// reaches the end kills the child.
pub struct ProcessOutput {
    inner: ReaderStream<ChildStdout>,
    guard: Option<DropGuard>,
}

impl Stream for ProcessOutput {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_next(cx);
        if let Poll::Ready(None) = poll {
            if let Some(guard) = this.guard.take() {
                guard.disarm();
            }
        }
        poll
    }
}

pub struct StreamingProcess {
    pub output: ProcessOutput,
    /// Resolves once the child has exited, with `None` if it was killed.
    pub exit: JoinHandle<Option<ExitStatus>>,
}

impl StreamingProcess {
    /// Spawns `command`, copies `input` into its stdin (closing stdin at the
    /// end) and exposes stdout as a stream. Stderr is logged.
    pub fn spawn<R>(mut command: Command, input: Option<R>) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Git("child stdout not piped".to_string()))?;

        let stdin = child.stdin.take();
        match (stdin, input) {
            (Some(mut stdin), Some(mut input)) => {
                tokio::spawn(async move {
                    if let Err(e) = tokio::io::copy(&mut input, &mut stdin).await {
                        tracing::debug!("Request body not fully delivered: {e}");
                    }
                    let _ = stdin.shutdown().await;
                });
            }
            (stdin, _) => drop(stdin),
        }

        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if stderr.read_to_end(&mut buf).await.is_ok() && !buf.is_empty() {
                    tracing::debug!("git: {}", String::from_utf8_lossy(&buf).trim_end());
                }
            });
        }

        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();

        let exit = tokio::spawn(async move {
            let outcome = tokio::select! {
                () = cancel.cancelled() => None,
                status = child.wait() => Some(status),
            };
            match outcome {
                Some(Ok(status)) => Some(status),
                Some(Err(e)) => {
                    tracing::warn!("Waiting on git failed: {e}");
                    None
                }
                None => {
                    tracing::debug!("Client went away, killing git");
                    let _ = child.kill().await;
                    None
                }
            }
        });

        Ok(Self {
            output: ProcessOutput {
                inner: ReaderStream::new(stdout),
                guard: Some(guard),
            },
            exit,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::process::Stdio;
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;

    fn piped(program: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    #[tokio::test]
    async fn test_streams_input_through() {
        let input = std::io::Cursor::new(b"request body".to_vec());
        let mut process = StreamingProcess::spawn(piped("cat", &[]), Some(input)).unwrap();

        let mut collected = Vec::new();
        while let Some(chunk) = process.output.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(collected, b"request body");
        assert!(process.exit.await.unwrap().unwrap().success());
    }

    #[tokio::test]
    async fn test_dropping_output_kills_child() {
        let process =
            StreamingProcess::spawn(piped("sleep", &["30"]), None::<tokio::io::Empty>).unwrap();
        drop(process.output);

        let status = tokio::time::timeout(Duration::from_secs(5), process.exit)
            .await
            .unwrap()
            .unwrap();
        assert!(status.is_none());
    }
}
