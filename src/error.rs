use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while talking to tmux
#[derive(Debug, Error)]
pub enum TmuxError {
    /// The tmux (or ssh) binary could not be located. Fatal at startup.
    #[error("{binary} binary not found in PATH")]
    BinaryNotFound {
        binary: String,
        #[source]
        source: which::Error,
    },

    /// The binary exists but could not be spawned
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A listing command exited non-zero; carries the raw output for diagnostics
    #[error("tmux {command} exited with {code}: {stdout}{stderr}")]
    Listing {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
}

/// Errors raised while bringing sessions, windows and panes into existence
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Tmux(#[from] TmuxError),

    #[error("could not create {target}: {reason}")]
    CreateFailed { target: String, reason: String },

    #[error("pane {target} did not appear after {splits} splits")]
    PaneUnreachable { target: String, splits: usize },
}

/// Errors raised while loading the YAML configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("included file {path} must contain a sequence")]
    IncludeNotSequence { path: PathBuf },

    #[error("window name {0:?} is defined more than once")]
    DuplicateWindow(String),

    #[error("no configuration file found (tried {0})")]
    NotFound(String),
}

/// Errors raised by orchestrator operations on a single window
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("window {0:?} is not configured")]
    UnknownWindow(String),

    #[error(transparent)]
    Tmux(#[from] TmuxError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// The control loop is gone, so the action could not be run
    #[error("control loop has shut down")]
    Closed,
}
