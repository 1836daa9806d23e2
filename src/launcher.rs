//! Spawning the worker process and carrying the protocol over its stdio.

use crate::child::{self, ChildLink, ChildOutput};
use crate::protocol::{self, FromWorker, ToWorker};
use anyhow::{Context, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;

/// Something that happened to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(FromWorker),
    /// The process ended; `None` when killed by a signal.
    Exited(Option<i32>),
    /// I/O failure on the link.
    Failed(String),
    /// The worker wrote a frame outside the protocol.
    ProtocolViolation(String),
}

/// An event tagged with the run generation of the worker that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub generation: u64,
    pub event: WorkerEvent,
}

/// Queues events of one worker onto the supervisor's channel.
#[derive(Clone)]
pub struct EventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { generation, tx }
    }

    pub fn send(&self, event: WorkerEvent) {
        // The receiver only goes away together with the supervisor.
        let _ = self.tx.send(Envelope {
            generation: self.generation,
            event,
        });
    }
}

/// A live worker as seen by the supervisor.
pub trait WorkerHandle: Send + 'static {
    /// Queue a message. Fails once the link to the worker is gone.
    fn send(&mut self, message: ToWorker) -> Result<()>;

    /// Close the link, wait up to `grace` for the worker to exit, then kill it.
    fn shutdown(self, grace: Duration) -> impl Future<Output = ()> + Send;
}

pub trait WorkerLauncher: Send {
    type Handle: WorkerHandle;

    fn launch(&mut self, cwd: &Path, events: EventSender) -> Result<Self::Handle>;
}

/// Launches `<program> worker --tool <tool>` and speaks the protocol over stdio.
pub struct ProcessLauncher {
    program: PathBuf,
    build_tool: String,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, build_tool: impl Into<String>) -> Self {
        Self {
            program,
            build_tool: build_tool.into(),
        }
    }

    /// Re-launch this executable in worker mode.
    pub fn current_exe(build_tool: impl Into<String>) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate own executable")?;
        Ok(Self::new(program, build_tool))
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Handle = ProcessWorker;

    fn launch(&mut self, cwd: &Path, events: EventSender) -> Result<ProcessWorker> {
        let mut child = Command::new(&self.program)
            .args(["worker", "--tool", &self.build_tool])
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker '{}'", self.program.display()))?;
        tracing::debug!(pid = child.id(), cwd = %cwd.display(), "worker spawned");

        let stdin = child.stdin.take().context("no stdin from worker")?;
        let tx = spawn_writer(stdin, events.clone());
        let link = child::supervise(child, move |output| match output {
            ChildOutput::Stdout(line) if line.trim().is_empty() => {}
            ChildOutput::Stdout(line) => match protocol::decode::<FromWorker>(&line) {
                Ok(message) => events.send(WorkerEvent::Message(message)),
                Err(e) => events.send(WorkerEvent::ProtocolViolation(e.to_string())),
            },
            // Panics and anything else the worker failed to route through the protocol.
            ChildOutput::Stderr(line) => {
                events.send(WorkerEvent::Message(FromWorker::log_error(line)))
            }
            ChildOutput::Exited(code) => events.send(WorkerEvent::Exited(code)),
            ChildOutput::Failed(e) => events.send(WorkerEvent::Failed(e)),
        })?;

        Ok(ProcessWorker { tx, link })
    }
}

/// Single writer for the worker's stdin, so frames never interleave.
fn spawn_writer(mut stdin: ChildStdin, events: EventSender) -> mpsc::UnboundedSender<ToWorker> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ToWorker>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = protocol::send(&mut stdin, &message).await {
                events.send(WorkerEvent::Failed(format!(
                    "Failed to write to worker: {e}"
                )));
                break;
            }
        }
        // Dropping stdin here is the worker's EOF.
    });
    tx
}

pub struct ProcessWorker {
    tx: mpsc::UnboundedSender<ToWorker>,
    link: ChildLink,
}

impl WorkerHandle for ProcessWorker {
    fn send(&mut self, message: ToWorker) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| anyhow::anyhow!("worker link closed"))
    }

    fn shutdown(self, grace: Duration) -> impl Future<Output = ()> + Send {
        let ProcessWorker { tx, link } = self;
        async move {
            drop(tx);
            link.shutdown(grace).await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// A shell script standing in for the worker binary.
    fn script_launcher(dir: &Path, body: &str) -> ProcessLauncher {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-worker.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        ProcessLauncher::new(path, "webpack")
    }

    async fn collect_until_exit(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<WorkerEvent> {
        let mut seen = Vec::new();
        while let Some(envelope) = rx.recv().await {
            assert_eq!(envelope.generation, 7);
            let done = matches!(envelope.event, WorkerEvent::Exited(_));
            seen.push(envelope.event);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn forwards_frames_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut launcher = script_launcher(
            dir.path(),
            r#"echo '{"command":"compile-progress","percent":50,"done":false}'
echo 'oops' >&2
exit 3"#,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _worker = launcher
            .launch(dir.path(), EventSender::new(7, tx))
            .unwrap();

        let seen = collect_until_exit(&mut rx).await;
        assert!(seen.contains(&WorkerEvent::Message(FromWorker::CompileProgress {
            percent: 50,
            done: false
        })));
        assert!(seen.contains(&WorkerEvent::Message(FromWorker::log_error("oops"))));
        assert_eq!(seen.last(), Some(&WorkerEvent::Exited(Some(3))));
    }

    #[tokio::test]
    async fn unknown_frame_is_a_protocol_violation() {
        let dir = tempfile::tempdir().unwrap();
        let mut launcher = script_launcher(dir.path(), r#"echo '{"command":"bogus"}'"#);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _worker = launcher
            .launch(dir.path(), EventSender::new(7, tx))
            .unwrap();

        let seen = collect_until_exit(&mut rx).await;
        assert!(seen
            .iter()
            .any(|e| matches!(e, WorkerEvent::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn frames_reach_worker_stdin() {
        let dir = tempfile::tempdir().unwrap();
        // Echo the first inbound frame back as a log line, then wait for EOF.
        let mut launcher = script_launcher(
            dir.path(),
            r#"read frame
printf '{"command":"log","items":["%s"]}\n' "$(echo "$frame" | tr -d '"')"
cat > /dev/null"#,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = launcher
            .launch(dir.path(), EventSender::new(7, tx))
            .unwrap();

        worker.send(ToWorker::Invalidate).unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(
            first.event,
            WorkerEvent::Message(FromWorker::log("{command:invalidate}"))
        );

        worker.shutdown(Duration::from_secs(5)).await;
        let seen = collect_until_exit(&mut rx).await;
        assert_eq!(seen.last(), Some(&WorkerEvent::Exited(Some(0))));
    }

    #[tokio::test]
    async fn shutdown_kills_a_worker_ignoring_eof() {
        let dir = tempfile::tempdir().unwrap();
        let mut launcher = script_launcher(dir.path(), "exec sleep 30");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut worker = launcher
            .launch(dir.path(), EventSender::new(7, tx))
            .unwrap();

        worker.send(ToWorker::Stop).unwrap();
        worker.shutdown(Duration::from_millis(100)).await;

        let seen = collect_until_exit(&mut rx).await;
        assert!(matches!(seen.last(), Some(WorkerEvent::Exited(_))));
    }

    #[tokio::test]
    async fn missing_program_fails_to_launch() {
        let dir = tempfile::tempdir().unwrap();
        let mut launcher = ProcessLauncher::new(dir.path().join("nope"), "webpack");
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(launcher.launch(dir.path(), EventSender::new(0, tx)).is_err());
    }
}
