//! The interactive host: a supervisor driven by line commands on stdin.

use crate::config::{Settings, SettingsLayer};
use crate::host::{ConsoleLog, DiagnosticStore, HostSinks, TracingNotifier};
use crate::launcher::ProcessLauncher;
use crate::supervisor::{ActiveEvent, BuildStatus, Supervisor, WorkerEvents};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "commands: start, stop, invalidate (trigger), status, reload, quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    Invalidate,
    Status,
    Reload,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "start" => Some(Command::Start),
            "stop" => Some(Command::Stop),
            "invalidate" | "trigger" => Some(Command::Invalidate),
            "status" => Some(Command::Status),
            "reload" => Some(Command::Reload),
            "quit" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

/// A supervisor that re-launches this executable as its worker.
pub fn supervisor(
    settings: &Settings,
    store: &DiagnosticStore,
) -> Result<(Supervisor<ProcessLauncher>, WorkerEvents)> {
    let launcher = ProcessLauncher::current_exe(settings.build_tool())?;
    let sinks = HostSinks {
        diagnostics: Box::new(store.clone()),
        log: Box::new(ConsoleLog),
        notifier: Box::new(TracingNotifier),
    };
    Ok(Supervisor::new(launcher, sinks))
}

pub async fn run(project: PathBuf, overrides: SettingsLayer) -> Result<()> {
    let settings = Settings::load(Some(&project), overrides.clone())?;
    let store = DiagnosticStore::new();
    let (mut supervisor, mut events) = supervisor(&settings, &store)?;

    supervisor
        .on_active(|event| match event {
            ActiveEvent::Enabled => tracing::info!("watching"),
            ActiveEvent::Disabled => tracing::info!("not watching"),
        })
        .forget();
    let _build = {
        let store = store.clone();
        supervisor.on_build(move |status| match status {
            BuildStatus::Success | BuildStatus::Failure => print_diagnostics(&store, *status),
            BuildStatus::Running { percent } => tracing::debug!("building {percent}%"),
            BuildStatus::Idle => {}
        })
    };

    supervisor.configure(settings.to_patch()).await;
    if settings.should_autostart() {
        supervisor.start();
    }
    println!("{HELP}");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(envelope) = events.recv() => supervisor.handle(envelope).await,
            line = stdin.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Some(Command::Start) => supervisor.start(),
                    Some(Command::Stop) => supervisor.stop().await,
                    Some(Command::Invalidate) => supervisor.invalidate(),
                    Some(Command::Status) => print_status(&supervisor, &store),
                    Some(Command::Reload) => reload(&mut supervisor, &project, &overrides).await,
                    Some(Command::Quit) => break,
                    None => println!("unknown command '{}'; {HELP}", line.trim()),
                }
            }
        }
    }

    supervisor.dispose().await;
    Ok(())
}

async fn reload(
    supervisor: &mut Supervisor<ProcessLauncher>,
    project: &Path,
    overrides: &SettingsLayer,
) {
    match Settings::load(Some(project), overrides.clone()) {
        Ok(settings) => {
            tracing::info!("settings reloaded");
            supervisor.configure(settings.to_patch()).await;
        }
        Err(e) => tracing::error!("{e:#}"),
    }
}

fn print_status(supervisor: &Supervisor<ProcessLauncher>, store: &DiagnosticStore) {
    let config = supervisor.configuration();
    let dir = config
        .working_directory
        .as_ref()
        .map_or_else(|| "-".to_string(), |d| d.display().to_string());
    let file = config
        .config_file
        .as_ref()
        .map_or_else(|| "-".to_string(), |f| f.display().to_string());
    let build = match supervisor.status().progress() {
        Some(percent) => format!("building {percent}%"),
        None => format!("{:?}", supervisor.status()).to_lowercase(),
    };
    println!(
        "{} | {build} | dir: {dir} | config: {file} | {}",
        if supervisor.is_active() { "active" } else { "idle" },
        store.status_string(),
    );
}

fn print_diagnostics(store: &DiagnosticStore, status: BuildStatus) {
    for (path, items) in store.snapshot() {
        for d in items {
            println!(
                "{}:{}:{}: {}: {}",
                path.display(),
                d.range.start.line + 1,
                d.range.start.character + 1,
                d.severity.label(),
                d.message.trim_end(),
            );
        }
    }
    match status {
        BuildStatus::Success => println!("build succeeded"),
        _ if store.is_empty() => println!("build failed"),
        _ => println!("build failed ({})", store.status_string()),
    }
}
