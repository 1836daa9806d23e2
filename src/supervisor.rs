//! The build supervisor: owns at most one worker and turns its messages into
//! diagnostics and status notifications.
//!
//! All state changes happen through `&mut self` on a single task. Worker I/O
//! runs elsewhere and only queues [`Envelope`]s, which the owner of the
//! supervisor feeds back through [`Supervisor::handle`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{ConfigPatch, Configuration};
use crate::diagnostics::{self, Diagnostic, Severity};
use crate::error::StartError;
use crate::host::{Emitter, HostSinks, Subscription};
use crate::launcher::{Envelope, EventSender, WorkerEvent, WorkerHandle, WorkerLauncher};
use crate::protocol::{FromWorker, Stats, ToWorker};

/// How long a stopping worker gets to close its watch session before it is killed.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveEvent {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Idle,
    /// `percent` is advisory, for display only.
    Running {
        percent: u8,
    },
    Success,
    Failure,
}

impl BuildStatus {
    pub fn progress(self) -> Option<u8> {
        match self {
            BuildStatus::Running { percent } => Some(percent),
            _ => None,
        }
    }
}

struct Run<H> {
    worker: H,
    working_directory: PathBuf,
    generation: u64,
}

enum State<H> {
    Idle,
    Active(Run<H>),
}

/// Receiving end for events of every worker this supervisor spawns.
pub struct WorkerEvents {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl WorkerEvents {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

pub struct Supervisor<L: WorkerLauncher> {
    launcher: L,
    config: Configuration,
    state: State<L::Handle>,
    next_generation: u64,
    events: mpsc::UnboundedSender<Envelope>,
    sinks: HostSinks,
    status: BuildStatus,
    active_emitter: Emitter<ActiveEvent>,
    build_emitter: Emitter<BuildStatus>,
    grace: Duration,
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new(launcher: L, sinks: HostSinks) -> (Self, WorkerEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            launcher,
            config: Configuration::default(),
            state: State::Idle,
            next_generation: 0,
            events,
            sinks,
            status: BuildStatus::Idle,
            active_emitter: Emitter::new(),
            build_emitter: Emitter::new(),
            grace: STOP_GRACE_PERIOD,
        };
        (supervisor, WorkerEvents { rx })
    }

    #[cfg(test)]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }

    pub fn status(&self) -> BuildStatus {
        self.status
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    pub fn on_active(&self, handler: impl Fn(&ActiveEvent) + Send + 'static) -> Subscription {
        self.active_emitter.subscribe(handler)
    }

    pub fn on_build(&self, handler: impl Fn(&BuildStatus) + Send + 'static) -> Subscription {
        self.build_emitter.subscribe(handler)
    }

    /// Merge `patch` into the configuration. A running build restarts only if
    /// the merged configuration actually changed.
    pub async fn configure(&mut self, patch: ConfigPatch) {
        let previous = self.config.clone();
        self.config.merge(patch);
        self.sinks.diagnostics.clear();

        if self.is_active() && self.config != previous {
            tracing::info!("configuration changed, restarting");
            self.stop().await;
            self.start();
        }
    }

    pub fn start(&mut self) {
        if self.is_active() {
            return;
        }
        let (working_directory, config_file) = match self.preconditions() {
            Ok(launch) => launch,
            Err(e) => {
                if e.is_blocking() {
                    self.sinks.notifier.show_error(&e.to_string());
                } else {
                    self.sinks.notifier.show_warning(&e.to_string());
                }
                return;
            }
        };

        let generation = self.next_generation;
        self.next_generation += 1;
        let sender = EventSender::new(generation, self.events.clone());
        let mut worker = match self.launcher.launch(&working_directory, sender) {
            Ok(worker) => worker,
            Err(e) => {
                tracing::error!("worker launch failed: {e:#}");
                self.sinks
                    .notifier
                    .show_error(&format!("webpack error: '{e:#}'"));
                return;
            }
        };

        if let Err(e) = worker.send(ToWorker::Start {
            cwd: working_directory.clone(),
            config_file,
        }) {
            // The exit event that follows resets the state.
            tracing::warn!("start message not delivered: {e:#}");
        }

        tracing::info!(dir = %working_directory.display(), generation, "build worker started");
        self.state = State::Active(Run {
            worker,
            working_directory,
            generation,
        });
        self.active_emitter.fire(&ActiveEvent::Enabled);
    }

    fn preconditions(&self) -> Result<(PathBuf, PathBuf), StartError> {
        let working_directory = self
            .config
            .working_directory
            .clone()
            .ok_or(StartError::NoWorkingDirectory)?;
        let config_file = self
            .config
            .config_file
            .clone()
            .ok_or(StartError::NoConfigFile)?;
        let resolved = working_directory.join(&config_file);
        if !resolved.exists() {
            return Err(StartError::ConfigFileMissing(resolved));
        }
        Ok((working_directory, config_file))
    }

    pub async fn stop(&mut self) {
        let State::Active(run) = std::mem::replace(&mut self.state, State::Idle) else {
            return;
        };
        self.sinks.diagnostics.clear();

        let mut worker = run.worker;
        if let Err(e) = worker.send(ToWorker::Stop) {
            tracing::debug!("worker already gone: {e:#}");
        }
        worker.shutdown(self.grace).await;

        tracing::info!(generation = run.generation, "build worker stopped");
        self.set_status(BuildStatus::Idle);
        self.active_emitter.fire(&ActiveEvent::Disabled);
    }

    pub fn invalidate(&mut self) {
        let State::Active(run) = &mut self.state else {
            return;
        };
        self.sinks.diagnostics.clear();
        if let Err(e) = run.worker.send(ToWorker::Invalidate) {
            tracing::debug!("invalidate not delivered: {e:#}");
        }
    }

    /// Stop and release the supervisor.
    pub async fn dispose(mut self) {
        tracing::debug!("disposing build supervisor");
        self.stop().await;
    }

    /// Process one event from a worker. Events of workers that are no longer
    /// the active one are dropped.
    pub async fn handle(&mut self, envelope: Envelope) {
        let working_directory = match &self.state {
            State::Active(run) if run.generation == envelope.generation => {
                run.working_directory.clone()
            }
            _ => {
                tracing::trace!(generation = envelope.generation, "dropping stale worker event");
                return;
            }
        };

        match envelope.event {
            WorkerEvent::Message(message) => self.on_message(message, working_directory),
            WorkerEvent::Exited(code) => {
                if code != Some(0) {
                    let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                    self.sinks
                        .notifier
                        .show_error(&format!("webpack terminated unexpected with code: {code}"));
                }
                self.abandon().await;
            }
            WorkerEvent::Failed(e) => {
                self.sinks
                    .notifier
                    .show_error(&format!("webpack error: '{e}'"));
                self.abandon().await;
            }
            WorkerEvent::ProtocolViolation(detail) => {
                tracing::error!("protocol violation from worker: {detail}");
                self.sinks
                    .notifier
                    .show_error(&format!("webpack worker sent an unknown message: {detail}"));
                self.abandon().await;
            }
        }
    }

    /// Forget the current worker without the stop handshake.
    async fn abandon(&mut self) {
        let State::Active(run) = std::mem::replace(&mut self.state, State::Idle) else {
            return;
        };
        run.worker.shutdown(Duration::ZERO).await;
        tracing::warn!(generation = run.generation, "build worker lost");
        self.active_emitter.fire(&ActiveEvent::Disabled);
    }

    fn on_message(&mut self, message: FromWorker, working_directory: PathBuf) {
        match message {
            FromWorker::Log { items } | FromWorker::LogError { items } => {
                self.sinks.log.append_line(&items.join(" "));
            }
            FromWorker::ResultError { error } => {
                self.sinks.notifier.show_error("webpack Error");
                let text = serde_json::to_string_pretty(&error).unwrap_or_else(|_| error.to_string());
                self.sinks.log.append_line(&text);
                self.set_status(BuildStatus::Failure);
            }
            FromWorker::ResultStats { stats } => self.on_stats(stats, working_directory),
            FromWorker::CompileProgress { percent, .. } => {
                self.set_status(BuildStatus::Running { percent });
            }
        }
    }

    /// Replace the whole diagnostic collection with what `stats` reports.
    fn on_stats(&mut self, stats: Stats, root: PathBuf) {
        self.sinks.diagnostics.clear();
        if let Ok(text) = serde_json::to_string_pretty(&stats) {
            self.sinks.log.append_line(&text);
        }

        let mut grouped: BTreeMap<PathBuf, Vec<Diagnostic>> = BTreeMap::new();
        let problems = [
            (Severity::Error, &stats.errors),
            (Severity::Warning, &stats.warnings),
        ];
        for (severity, items) in problems {
            for raw in items {
                self.sinks.log.append_line(raw);
                match diagnostics::parse(severity, raw, &root) {
                    Some(diagnostic) => grouped
                        .entry(diagnostic.uri.clone())
                        .or_default()
                        .push(diagnostic),
                    None => tracing::debug!("no dialect matched {} output", severity.label()),
                }
            }
        }
        for (uri, items) in grouped {
            self.sinks.diagnostics.set(uri, items);
        }

        self.set_status(if stats.is_clean() {
            BuildStatus::Success
        } else {
            BuildStatus::Failure
        });
    }

    fn set_status(&mut self, status: BuildStatus) {
        self.status = status;
        self.build_emitter.fire(&status);
    }
}
