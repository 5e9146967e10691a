//! One-shot and streaming subprocess execution.
//!
//! The `Executor` owns a binary path and a per-invocation timeout. Buffered
//! runs go through `execute`; `stream` bridges a running process's stdout
//! into a bounded chunk channel with the terminal-chunk contract enforced
//! here, so adapters never re-implement it.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::StreamChunk;
use crate::error::{Error, Result};

/// Capacity of the chunk channel; backpressure blocks the producer.
const CHUNK_CAPACITY: usize = 32;

/// Buffered output of a completed invocation.
#[derive(Debug)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A started process with live output pipes.
pub struct SpawnedChild {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub handle: Box<dyn ChildHandle>,
}

/// Handle to a running child process.
#[async_trait]
pub trait ChildHandle: Send {
    async fn wait(&mut self) -> std::io::Result<ExitStatus>;
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// Capability for launching commands, injectable for tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion with buffered output.
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> std::io::Result<Output>;

    /// Start the command and hand back live pipes plus a wait/kill handle.
    async fn start(
        &self,
        program: &Path,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> std::io::Result<SpawnedChild>;
}

/// `CommandRunner` backed by `tokio::process`.
pub struct TokioCommandRunner;

struct TokioChild(tokio::process::Child);

#[async_trait]
impl ChildHandle for TokioChild {
    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.0.wait().await
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.0.kill().await
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> std::io::Result<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(data) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(&data).await?;
                pipe.shutdown().await?;
            }
        }

        child.wait_with_output().await
    }

    async fn start(
        &self,
        program: &Path,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> std::io::Result<SpawnedChild> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().expect("stdout was requested piped");
        let stderr = child.stderr.take().expect("stderr was requested piped");

        if let Some(data) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                tokio::spawn(async move {
                    let _ = pipe.write_all(&data).await;
                    let _ = pipe.shutdown().await;
                });
            }
        }

        Ok(SpawnedChild {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            handle: Box::new(TokioChild(child)),
        })
    }
}

/// Runs a single external binary with a per-invocation timeout.
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    binary_path: PathBuf,
    timeout: Duration,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("binary_path", &self.binary_path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Executor {
    /// Create an executor. The binary must exist at construction time.
    pub fn new(binary_path: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let binary_path = binary_path.into();
        std::fs::metadata(&binary_path)
            .map_err(|e| Error::Config(format!("binary not found: {}: {e}", binary_path.display())))?;

        Ok(Self {
            binary_path,
            timeout,
            runner: Arc::new(TokioCommandRunner),
        })
    }

    /// Create an executor with a custom runner, skipping the existence check.
    pub fn with_runner(
        binary_path: impl Into<PathBuf>,
        timeout: Duration,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            binary_path: binary_path.into(),
            timeout,
            runner,
        }
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Run the command to completion. A non-zero exit becomes an error
    /// carrying the stderr tail.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput> {
        let run = self.runner.run(&self.binary_path, args, stdin);
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            res = tokio::time::timeout(self.timeout, run) => match res {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => {
                    return Err(Error::Execution(format!(
                        "{} timed out after {:?}",
                        self.binary_path.display(),
                        self.timeout
                    )))
                }
            },
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Execution(format!(
                "{} {}: {}",
                self.binary_path.display(),
                output.status,
                stderr.trim()
            )));
        }

        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Start the command and stream its stdout line by line.
    ///
    /// Each complete line is forwarded as one data chunk with a trailing
    /// newline. Stderr is drained concurrently and kept for the terminal
    /// error message. Cancellation is observed at send boundaries and
    /// reported as the terminal chunk's error.
    pub async fn stream(
        &self,
        cancel: &CancellationToken,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let child = self
            .runner
            .start(&self.binary_path, args, stdin)
            .await
            .map_err(|e| Error::Execution(format!("failed to start command: {e}")))?;

        let (tx, rx) = mpsc::channel(CHUNK_CAPACITY);
        let cancel = cancel.child_token();
        let timeout = self.timeout;
        tokio::spawn(stream_worker(child, tx, cancel, timeout));

        Ok(rx)
    }
}

async fn stream_worker(
    mut child: SpawnedChild,
    tx: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
    timeout: Duration,
) {
    let deadline = Instant::now() + timeout;

    let mut stderr = child.stderr;
    let drain = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let mut lines = BufReader::new(child.stdout).lines();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.handle.kill().await;
                let _ = tx.send(StreamChunk::failed(Error::Canceled)).await;
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = child.handle.kill().await;
                let _ = tx
                    .send(StreamChunk::failed(Error::Execution(format!(
                        "stream timed out after {timeout:?}"
                    ))))
                    .await;
                return;
            }
            line = lines.next_line() => line,
        };

        match next {
            Ok(Some(mut line)) => {
                line.push('\n');
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.handle.kill().await;
                        let _ = tx.send(StreamChunk::failed(Error::Canceled)).await;
                        return;
                    }
                    sent = tx.send(StreamChunk::data(line.into_bytes())) => {
                        if sent.is_err() {
                            // Consumer went away; reap the child and stop.
                            let _ = child.handle.kill().await;
                            return;
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = child.handle.kill().await;
                let _ = tx.send(StreamChunk::failed(Error::Io(e))).await;
                return;
            }
        }
    }

    let stderr_buf = drain.await.unwrap_or_default();
    match child.handle.wait().await {
        Ok(status) if status.success() => {
            let _ = tx.send(StreamChunk::done()).await;
        }
        Ok(status) => {
            let stderr = String::from_utf8_lossy(&stderr_buf);
            let message = if stderr.trim().is_empty() {
                format!("process exited with {status}")
            } else {
                format!("process exited with {status}: {}", stderr.trim())
            };
            let _ = tx.send(StreamChunk::failed(Error::Execution(message))).await;
        }
        Err(e) => {
            let _ = tx.send(StreamChunk::failed(Error::Io(e))).await;
        }
    }
}
