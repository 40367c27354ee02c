//! Error taxonomy for stanrun.

use std::path::PathBuf;

/// Which side of a column-set comparison a column was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSide {
    /// Present in chain 0 but absent from the offending chain.
    Missing,
    /// Present in the offending chain but absent from chain 0.
    Extra,
}

impl std::fmt::Display for ColumnSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnSide::Missing => write!(f, "missing"),
            ColumnSide::Extra => write!(f, "extra"),
        }
    }
}

/// Errors produced while building, running and aggregating models.
#[derive(Debug, thiserror::Error)]
pub enum StanError {
    #[error("CmdStan installation not found: {reason}")]
    CmdStanNotFound { reason: String },

    #[error("invalid run configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid data binding '{name}': {reason}")]
    InvalidData { name: String, reason: String },

    #[error("malformed dump data at line {line}: {reason}")]
    DumpParse { line: usize, reason: String },

    #[error("invalid argument '{token}': {reason}")]
    InvalidArgument { token: String, reason: String },

    #[error("compilation of {} failed: {stderr}", .model.display())]
    Compilation { model: PathBuf, stderr: String },

    #[error("failed to launch {}: {source}", .program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("chain {chain} exited with code {}: {stderr}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Invocation {
        chain: usize,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("chain {chain} produced no output file at {}: {stderr}", .path.display())]
    MissingOutput {
        chain: usize,
        path: PathBuf,
        stderr: String,
    },

    #[error("chain {chain} timed out after {timeout_secs} seconds")]
    ChainTimeout { chain: usize, timeout_secs: u64 },

    #[error("parse error in {} at line {line}: {reason}", .path.display())]
    Parse {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    #[error("column '{column}' has {actual} values, expected {expected}")]
    RaggedTable {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("duplicate column '{column}'")]
    DuplicateColumn { column: String },

    #[error("column '{column}' is {side} in chain {chain}")]
    ColumnMismatch {
        column: String,
        chain: usize,
        side: ColumnSide,
    },

    #[error("column not found: {column}")]
    ColumnNotFound { column: String },

    #[error("diagnostics unavailable: {reason}")]
    DiagnosticsUnavailable { reason: String },

    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("chain task join error: {0}")]
    TaskJoin(String),
}

impl StanError {
    /// Build a closure that wraps an [`std::io::Error`] with the path it concerns.
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> StanError {
        let path = path.into();
        move |source| StanError::Io { path, source }
    }

    /// The chain this error is attributed to, if any.
    pub fn chain(&self) -> Option<usize> {
        match self {
            StanError::Invocation { chain, .. }
            | StanError::MissingOutput { chain, .. }
            | StanError::ChainTimeout { chain, .. }
            | StanError::ColumnMismatch { chain, .. } => Some(*chain),
            _ => None,
        }
    }
}

/// Result type for stanrun operations.
pub type Result<T> = std::result::Result<T, StanError>;
