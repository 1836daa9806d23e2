use std::path::PathBuf;
use thiserror::Error;

/// Why the supervisor refused to start a build.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("No working directory (defaults to project root)")]
    NoWorkingDirectory,
    #[error("No webpack configuration file defined")]
    NoConfigFile,
    #[error("Defined webpack configuration file doesn't exist: {}", .0.display())]
    ConfigFileMissing(PathBuf),
}

impl StartError {
    /// A missing directory blocks everything; the others are warnings.
    pub fn is_blocking(&self) -> bool {
        matches!(self, StartError::NoWorkingDirectory)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame {frame:?}: {source}")]
    Malformed {
        frame: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("cannot resolve '{tool}' from {}", .cwd.display())]
    ToolNotFound { tool: String, cwd: PathBuf },
    #[error("configuration file {} doesn't exist", .0.display())]
    ConfigMissing(PathBuf),
}
