//! Terminal-style task wrapping a supervisor: open starts the build, status
//! lines are written as builds finish, input is echoed and ETX closes.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::host::Subscription;
use crate::launcher::WorkerLauncher;
use crate::supervisor::{BuildStatus, Supervisor, WorkerEvents};

/// End-of-text, what a terminal sends for Ctrl+C.
const ETX: &str = "\u{3}";

pub struct TaskExecution<L: WorkerLauncher> {
    supervisor: Supervisor<L>,
    events: WorkerEvents,
    output: mpsc::UnboundedSender<String>,
    pending: mpsc::UnboundedReceiver<String>,
    subscription: Option<Subscription>,
}

impl<L: WorkerLauncher> TaskExecution<L> {
    pub fn new(supervisor: Supervisor<L>, events: WorkerEvents) -> Self {
        let (output, pending) = mpsc::unbounded_channel();
        Self {
            supervisor,
            events,
            output,
            pending,
            subscription: None,
        }
    }

    pub fn open(&mut self) {
        let output = self.output.clone();
        self.subscription = Some(self.supervisor.on_build(move |status| {
            let line = match status {
                BuildStatus::Success => "Build successful\r\n",
                BuildStatus::Failure => "Build failed\r\n",
                _ => return,
            };
            let _ = output.send(line.to_string());
        }));
        self.supervisor.start();
    }

    /// Feed terminal input. Returns `false` once the task has closed.
    pub async fn input(&mut self, data: &str) -> bool {
        if data == ETX {
            self.close().await;
            return false;
        }
        let _ = self.output.send(echo(data));
        true
    }

    pub async fn close(&mut self) {
        self.supervisor.stop().await;
        if let Some(subscription) = self.subscription.take() {
            subscription.dispose();
        }
    }

    /// Open, then pump worker events and terminal I/O until ETX or end of input.
    pub async fn run<R, W>(mut self, input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.open();
        let mut lines = input.lines();

        loop {
            tokio::select! {
                Some(text) = self.pending.recv() => {
                    output.write_all(text.as_bytes()).await.context("Failed to write task output")?;
                    output.flush().await?;
                }
                Some(envelope) = self.events.recv() => self.supervisor.handle(envelope).await,
                line = lines.next_line() => {
                    let open = match line.context("Failed to read task input")? {
                        Some(line) if line.trim_end_matches('\r') == ETX => self.input(ETX).await,
                        Some(line) => self.input(&format!("{line}\n")).await,
                        None => {
                            self.close().await;
                            false
                        }
                    };
                    if !open {
                        break;
                    }
                }
            }
        }

        while let Ok(text) = self.pending.try_recv() {
            output.write_all(text.as_bytes()).await?;
        }
        output.flush().await?;
        self.supervisor.dispose().await;
        Ok(())
    }
}

fn echo(data: &str) -> String {
    data.replace("\r\n", "\n").replace('\n', "\r\n")
}
