//! The worker process: receives protocol messages on stdin, runs the build tool
//! in watch mode and reports back on stdout.
//!
//! Stdout carries nothing but protocol frames. Everything the worker logs is
//! turned into `log` / `log-error` frames by [`FrameMakeWriter`].

use crate::child::{self, ChildLink, ChildOutput};
use crate::protocol::{self, FromWorker, ToWorker};
use crate::webpack::{OutputDecoder, WatchCommand};
use anyhow::{Context, Result};
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// How long the build tool gets to close its watch session. Together with
/// [`WRITER_DRAIN`] this must fit inside the supervisor's stop grace period,
/// or the worker is killed before it gets to kill the build tool.
pub const CLOSE_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// How long queued frames may take to reach stdout before the worker exits.
const WRITER_DRAIN: Duration = Duration::from_millis(200);

/// Outbound queue drained by the single stdout writer.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<FromWorker>,
}

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FromWorker>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, message: FromWorker) {
        let _ = self.tx.send(message);
    }
}

/// Formats tracing records into `log` frames, or `log-error` from WARN up.
pub struct FrameMakeWriter {
    out: Outbound,
}

impl FrameMakeWriter {
    pub fn new(out: Outbound) -> Self {
        Self { out }
    }
}

pub struct FrameWriter {
    out: Outbound,
    error: bool,
    buf: Vec<u8>,
}

impl io::Write for FrameWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.buf);
        let line = text.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return;
        }
        self.out.send(if self.error {
            FromWorker::log_error(line)
        } else {
            FromWorker::log(line)
        });
    }
}

impl<'a> MakeWriter<'a> for FrameMakeWriter {
    type Writer = FrameWriter;

    fn make_writer(&'a self) -> Self::Writer {
        FrameWriter {
            out: self.out.clone(),
            error: false,
            buf: Vec::new(),
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        FrameWriter {
            out: self.out.clone(),
            error: *meta.level() <= Level::WARN,
            buf: Vec::new(),
        }
    }
}

fn init_tracing(out: Outbound) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_ansi(false)
                .without_time()
                .with_target(false)
                .with_writer(FrameMakeWriter::new(out)),
        )
        .with(env_filter)
        .init();
}

/// Output of one build tool process, tagged with its spawn generation.
#[derive(Debug)]
struct ToolEvent {
    generation: u64,
    output: ChildOutput,
}

/// One running build tool process.
struct ToolProcess {
    generation: u64,
    stdin: Option<ChildStdin>,
    link: ChildLink,
}

impl ToolProcess {
    fn spawn(
        command: &WatchCommand,
        generation: u64,
        events: mpsc::UnboundedSender<ToolEvent>,
    ) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", command.program.display()))?;
        let stdin = child.stdin.take();
        let link = child::supervise(child, move |output| {
            let _ = events.send(ToolEvent { generation, output });
        })?;
        Ok(Self {
            generation,
            stdin,
            link,
        })
    }

    async fn close(mut self, grace: Duration) {
        drop(self.stdin.take());
        self.link.shutdown(grace).await;
    }
}

/// An open watch session; the process is `None` after the build tool died.
struct Session {
    command: WatchCommand,
    process: Option<ToolProcess>,
}

/// Reacts to inbound messages and to the build tool's output.
pub struct Controller {
    tool: String,
    out: Outbound,
    session: Option<Session>,
    decoder: OutputDecoder,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<ToolEvent>,
    events_rx: mpsc::UnboundedReceiver<ToolEvent>,
    grace: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

impl Controller {
    pub fn new(tool: impl Into<String>, out: Outbound) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            tool: tool.into(),
            out,
            session: None,
            decoder: OutputDecoder::new(),
            next_generation: 0,
            events_tx,
            events_rx,
            grace: CLOSE_GRACE_PERIOD,
        }
    }

    #[cfg(test)]
    pub fn is_watching(&self) -> bool {
        self.session.is_some()
    }

    pub async fn handle(&mut self, message: ToWorker) -> Flow {
        match message {
            ToWorker::Start { cwd, config_file } => {
                self.close().await;
                if let Err(e) = self.open(&cwd, &config_file) {
                    tracing::error!("{e:#}");
                }
                Flow::Continue
            }
            ToWorker::Invalidate => {
                self.invalidate().await;
                Flow::Continue
            }
            ToWorker::Stop => {
                self.close().await;
                Flow::Exit
            }
        }
    }

    fn open(&mut self, cwd: &Path, config_file: &Path) -> Result<()> {
        let command = WatchCommand::resolve(&self.tool, cwd, config_file)?;
        tracing::info!(
            "Starting {} --watch in {}",
            command.program.display(),
            cwd.display()
        );
        let process = self.spawn(&command)?;
        self.session = Some(Session {
            command,
            process: Some(process),
        });
        Ok(())
    }

    fn spawn(&mut self, command: &WatchCommand) -> Result<ToolProcess> {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.decoder.reset();
        ToolProcess::spawn(command, generation, self.events_tx.clone())
    }

    /// Restart the build tool so the whole compile runs again.
    async fn invalidate(&mut self) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!("invalidate without a watch session");
            return;
        };
        if let Some(process) = session.process.take() {
            process.close(Duration::ZERO).await;
        }
        let command = session.command.clone();
        match self.spawn(&command) {
            Ok(process) => {
                if let Some(session) = self.session.as_mut() {
                    session.process = Some(process);
                }
            }
            Err(e) => tracing::error!("{e:#}"),
        }
    }

    /// Close the watch session, if any. The controller is inert afterwards.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Some(process) = session.process {
                process.close(self.grace).await;
            }
            tracing::debug!("watch session closed");
        }
        self.decoder.reset();
    }

    async fn next_event(&mut self) -> Option<ToolEvent> {
        self.events_rx.recv().await
    }

    fn current_generation(&self) -> Option<u64> {
        self.session
            .as_ref()
            .and_then(|s| s.process.as_ref())
            .map(|p| p.generation)
    }

    fn on_tool_event(&mut self, event: ToolEvent) {
        if self.current_generation() != Some(event.generation) {
            return;
        }
        let messages = match event.output {
            ChildOutput::Stdout(line) => self.decoder.stdout_line(&line),
            ChildOutput::Stderr(line) => self.decoder.stderr_line(&line),
            ChildOutput::Exited(code) => {
                if let Some(session) = self.session.as_mut() {
                    session.process = None;
                }
                self.decoder.reset();
                vec![FromWorker::ResultError {
                    error: serde_json::json!({
                        "message": format!("{} exited unexpectedly", self.tool),
                        "code": code,
                    }),
                }]
            }
            ChildOutput::Failed(e) => vec![FromWorker::log_error(e)],
        };
        for message in messages {
            self.out.send(message);
        }
    }
}

/// Entry point of `watch-runner worker`.
pub async fn run(tool: String) -> Result<()> {
    let (out, mut out_rx) = Outbound::channel();
    init_tracing(out.clone());

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = out_rx.recv().await {
            if protocol::send(&mut stdout, &message).await.is_err() {
                break;
            }
        }
    });

    let result = serve(&mut Controller::new(tool, out)).await;

    // The controller and the tracing writer hold the last senders; once the
    // controller is gone only the subscriber remains, so don't wait forever.
    let _ = tokio::time::timeout(WRITER_DRAIN, writer).await;
    result
}

async fn serve(controller: &mut Controller) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    tracing::debug!("stdin closed");
                    controller.close().await;
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }
                let message = match protocol::decode::<ToWorker>(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!("{e}");
                        controller.close().await;
                        return Err(e.into());
                    }
                };
                if controller.handle(message).await == Flow::Exit {
                    return Ok(());
                }
            }
            Some(event) = controller.next_event() => controller.on_tool_event(event),
        }
    }
}
