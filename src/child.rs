//! Line-oriented supervision of a child process's output and lifetime.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How long the exit report waits for the output readers to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOutput {
    Stdout(String),
    Stderr(String),
    /// Always the last output; `None` when ended by a signal.
    Exited(Option<i32>),
    Failed(String),
}

/// Keeps a supervised child alive; dropping it kills the child.
pub struct ChildLink {
    kill: Option<oneshot::Sender<()>>,
    exited: oneshot::Receiver<()>,
}

/// Take the child's stdout and stderr and report every line, then its exit, to `sink`.
pub fn supervise<F>(mut child: Child, sink: F) -> Result<ChildLink>
where
    F: Fn(ChildOutput) + Send + Sync + 'static,
{
    let stdout = child.stdout.take().context("no stdout from child")?;
    let stderr = child.stderr.take().context("no stderr from child")?;
    let sink = Arc::new(sink);

    let readers = [
        tokio::spawn(read_lines(stdout, sink.clone(), ChildOutput::Stdout)),
        tokio::spawn(read_lines(stderr, sink.clone(), ChildOutput::Stderr)),
    ];

    let (kill_tx, kill_rx) = oneshot::channel();
    let (exited_tx, exited_rx) = oneshot::channel();
    tokio::spawn(monitor(child, readers, kill_rx, exited_tx, sink));

    Ok(ChildLink {
        kill: Some(kill_tx),
        exited: exited_rx,
    })
}

impl ChildLink {
    /// Wait up to `grace` for the child to exit on its own, then kill it.
    pub async fn shutdown(mut self, grace: Duration) {
        if tokio::time::timeout(grace, &mut self.exited).await.is_ok() {
            return;
        }
        tracing::debug!("child didn't exit in {grace:?}, killing");
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        let _ = (&mut self.exited).await;
    }
}

async fn read_lines<R, F>(stream: R, sink: Arc<F>, wrap: fn(String) -> ChildOutput)
where
    R: AsyncRead + Unpin,
    F: Fn(ChildOutput),
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => sink(wrap(line)),
            Ok(None) => break,
            Err(e) => {
                sink(ChildOutput::Failed(format!("Failed to read child output: {e}")));
                break;
            }
        }
    }
}

async fn monitor<F>(
    mut child: Child,
    readers: [JoinHandle<()>; 2],
    kill: oneshot::Receiver<()>,
    exited: oneshot::Sender<()>,
    sink: Arc<F>,
) where
    F: Fn(ChildOutput),
{
    let status = tokio::select! {
        status = child.wait() => status,
        // Also taken when the link is dropped.
        _ = kill => {
            if let Err(e) = child.kill().await {
                tracing::debug!("kill failed: {e}");
            }
            child.wait().await
        }
    };

    for reader in readers {
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
    }
    match status {
        Ok(status) => sink(ChildOutput::Exited(status.code())),
        Err(e) => sink(ChildOutput::Failed(format!("Failed to wait for child: {e}"))),
    }
    let _ = exited.send(());
}
