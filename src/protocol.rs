use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Message from supervisor to worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ToWorker {
    /// Open a watch session
    #[serde(rename_all = "camelCase")]
    Start {
        /// Directory the build tool is resolved from and runs in
        cwd: PathBuf,
        /// Build tool configuration, relative to `cwd`
        config_file: PathBuf,
    },
    /// Re-run the current watch cycle
    Invalidate,
    /// Close the watch session
    Stop,
}

/// Message from worker to supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum FromWorker {
    /// Console output of the worker or build tool
    Log { items: Vec<String> },
    /// Error output of the worker or build tool
    LogError { items: Vec<String> },
    /// Compile progress tick
    CompileProgress { percent: u8, done: bool },
    /// The compiler failed without producing stats
    ResultError { error: serde_json::Value },
    /// Errors and warnings of a finished compile
    ResultStats { stats: Stats },
}

impl FromWorker {
    pub fn log(line: impl Into<String>) -> Self {
        FromWorker::Log {
            items: vec![line.into()],
        }
    }

    pub fn log_error(line: impl Into<String>) -> Self {
        FromWorker::LogError {
            items: vec![line.into()],
        }
    }
}

/// Compile summary restricted to errors and warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Stats {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

/// Decode one newline-delimited frame.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(line.trim_end()).map_err(|source| ProtocolError::Malformed {
        frame: line.trim_end().to_string(),
        source,
    })
}

/// Write one message as a single JSON line.
pub async fn send<W, T>(writer: &mut W, message: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(message)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
