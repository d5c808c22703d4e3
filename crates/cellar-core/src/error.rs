//! Error types for cellar-core.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::notebook::Output;

/// Result type for cellar-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cellar-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Kernel failure (start, transport, cell errors).
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// A notebook failed to execute and `raise_on_error` is set.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Cache store failure that could not be downgraded to a miss.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Failed to read or write a notebook document.
    #[error("failed to read notebook {path}: {message}")]
    NotebookRead { path: PathBuf, message: String },

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The client does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Failures reported by a kernel client.
#[derive(Debug, Error)]
pub enum KernelError {
    /// No installed kernel matches the requested name, or it failed to launch.
    #[error("failed to start kernel '{kernel}': {reason}")]
    Start { kernel: String, reason: String },

    /// The transport to the kernel broke mid-execution.
    #[error("kernel communication failed: {0}")]
    Communication(String),

    /// A cell did not finish within its timeout.
    #[error("cell timed out after {}s", timeout.as_secs_f64())]
    CellTimeout {
        timeout: Duration,
        /// Outputs the kernel emitted before the deadline.
        outputs: Vec<Output>,
    },

    /// The kernel reported an exception while running a cell.
    #[error("{}", .0)]
    CellExecution(Box<CellException>),

    /// An inline evaluation referenced an invalid or undefined name.
    #[error("invalid or undefined name for evaluation: {0}")]
    EvalName(String),
}

impl KernelError {
    /// Short class name, as used in the execution statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::Start { .. } => "KernelStartError",
            KernelError::Communication(_) => "KernelCommunicationError",
            KernelError::CellTimeout { .. } => "CellTimeoutError",
            KernelError::CellExecution(_) => "CellExecutionError",
            KernelError::EvalName(_) => "EvalNameError",
        }
    }

    /// Whether the failure is confined to a single cell.
    ///
    /// Cell-level failures may be recorded and skipped past when errors are
    /// allowed; everything else ends the notebook run.
    pub fn is_cell_level(&self) -> bool {
        matches!(
            self,
            KernelError::CellTimeout { .. } | KernelError::CellExecution(_)
        )
    }
}

/// An exception raised inside the kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct CellException {
    /// Exception class name (e.g. `ValueError`).
    pub ename: String,
    /// Exception message.
    pub evalue: String,
    /// Remote traceback lines.
    pub traceback: Vec<String>,
    /// All outputs of the cell, ending with the error output.
    pub outputs: Vec<Output>,
}

impl std::fmt::Display for CellException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.ename, self.evalue)
    }
}

/// A notebook run that aborted before all cells were processed.
#[derive(Debug, Error)]
#[error("executing {document} failed at cell {}: {cause}", cell_index.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string()))]
pub struct ExecutionError {
    /// Document identity of the notebook.
    pub document: String,
    /// Index (into the notebook's cells) of the failing cell, if any.
    pub cell_index: Option<usize>,
    /// Underlying kernel failure.
    #[source]
    pub cause: KernelError,
}

impl ExecutionError {
    /// Remote traceback text, when the cause carries one.
    pub fn traceback(&self) -> Option<String> {
        match &self.cause {
            KernelError::CellExecution(exc) => Some(exc.traceback.join("\n")),
            _ => None,
        }
    }
}

/// Cache store failures.
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error reading/writing the store.
    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record format version mismatch.
    #[error("cache version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// The record is unreadable or its payload is malformed.
    #[error("corrupt cache record: {0}")]
    Corrupt(String),

    /// Failed to serialize a record.
    #[error("cache serialize error: {0}")]
    Serialize(String),

    /// Failed to acquire the per-key lock.
    #[error("failed to lock cache entry {key}: {source}")]
    Lock {
        key: String,
        #[source]
        source: std::io::Error,
    },
}
