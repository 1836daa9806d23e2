mod child;
mod config;
mod console;
mod diagnostics;
mod error;
mod host;
mod launcher;
mod protocol;
mod supervisor;
mod task;
mod webpack;
mod worker;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{Settings, SettingsLayer};
use diagnostics::Severity;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "watch-runner")]
#[command(about = "Runs a webpack watch build in a worker process and reports its diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct SettingsArgs {
    /// Project root (defaults to the current directory)
    #[arg(short, long)]
    project: Option<PathBuf>,

    /// Directory the build runs in, relative to the project root
    #[arg(short = 'd', long)]
    execution_directory: Option<String>,

    /// Webpack configuration file, relative to the execution directory
    #[arg(short, long)]
    config_file: Option<String>,

    /// Build tool to resolve from node_modules/.bin
    #[arg(short, long)]
    build_tool: Option<String>,

    /// Don't start building until asked to
    #[arg(long, default_value = "false")]
    no_autostart: bool,
}

impl SettingsArgs {
    fn project(&self) -> Result<PathBuf> {
        match &self.project {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir().context("Failed to read current directory"),
        }
    }

    fn overrides(&self) -> SettingsLayer {
        SettingsLayer {
            execution_directory: self.execution_directory.clone(),
            config_file: self.config_file.clone(),
            start_on_activation: self.no_autostart.then_some(false),
            build_tool: self.build_tool.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the project and print diagnostics after every build
    Watch {
        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Run as a terminal task: report each build, Ctrl+C to close
    Task {
        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Worker process entry, spawned by the supervisor
    #[command(hide = true)]
    Worker {
        /// Build tool to run in watch mode
        #[arg(long, default_value = "webpack")]
        tool: String,
    },

    /// Parse a captured error message into a diagnostic
    Check {
        /// File holding the raw error text
        file: PathBuf,

        /// Root that relative paths resolve against
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// Report as a warning instead of an error
        #[arg(long, default_value = "false")]
        warning: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { settings } => {
            init_tracing();
            console::run(settings.project()?, settings.overrides()).await?;
        }
        Commands::Task { settings } => {
            init_tracing();
            run_task(settings).await?;
        }
        Commands::Worker { tool } => {
            // Tracing is routed into the protocol by the worker itself.
            worker::run(tool).await?;
        }
        Commands::Check {
            file,
            root,
            warning,
        } => {
            let input = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let root = std::path::absolute(&root)
                .with_context(|| format!("Failed to resolve {}", root.display()))?;
            let severity = if warning {
                Severity::Warning
            } else {
                Severity::Error
            };
            match diagnostics::parse(severity, &input, &root) {
                Some(diagnostic) => println!("{}", serde_json::to_string_pretty(&diagnostic)?),
                None => {
                    println!("No diagnostic recognized.");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

async fn run_task(args: SettingsArgs) -> Result<()> {
    let settings = Settings::load(Some(&args.project()?), args.overrides())?;
    let store = host::DiagnosticStore::new();
    let (mut supervisor, events) = console::supervisor(&settings, &store)?;
    supervisor.configure(settings.to_patch()).await;

    let input = tokio::io::BufReader::new(tokio::io::stdin());
    task::TaskExecution::new(supervisor, events)
        .run(input, tokio::io::stdout())
        .await
}
