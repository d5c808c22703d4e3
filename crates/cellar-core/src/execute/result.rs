//! The record handed back to the caller after a notebook is processed.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::state::ExecutionState;
use crate::config::ExecutionMode;
use crate::error::ExecutionError;
use crate::notebook::Notebook;

/// Summary of how a notebook's outputs were produced.
///
/// This is what the statistics collector stores per document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// When the outputs were produced (Unix seconds). For cache hits this is
    /// when the entry was written.
    pub mtime: f64,
    /// Execution time in seconds.
    pub runtime: Option<f64>,
    /// Mode the notebook was processed under.
    pub method: ExecutionMode,
    /// Whether execution finished without an aborting failure.
    pub succeeded: bool,
    /// Whether the outputs came from the cache.
    #[serde(default)]
    pub from_cache: bool,
    /// Error class name of the failure.
    pub error: Option<String>,
    /// Traceback of the failure.
    pub traceback: Option<String>,
}

impl ExecutionMetadata {
    fn executed(method: ExecutionMode, runtime: Duration, error: Option<&ExecutionError>) -> Self {
        Self {
            mtime: unix_seconds(SystemTime::now()),
            runtime: Some(runtime.as_secs_f64()),
            method,
            succeeded: error.is_none(),
            from_cache: false,
            error: error.map(|e| e.cause.kind().to_string()),
            traceback: error.map(|e| e.traceback().unwrap_or_else(|| e.to_string())),
        }
    }

    fn cached(method: ExecutionMode, created_at: SystemTime, runtime: Option<Duration>) -> Self {
        Self {
            mtime: unix_seconds(created_at),
            runtime: runtime.map(|d| d.as_secs_f64()),
            method,
            succeeded: true,
            from_cache: true,
            error: None,
            traceback: None,
        }
    }
}

/// Outcome of processing one notebook. Created once, never mutated.
#[derive(Debug)]
pub struct ExecutionResult {
    notebook: Notebook,
    state: ExecutionState,
    duration: Duration,
    error: Option<ExecutionError>,
    artifacts: Vec<PathBuf>,
    metadata: Option<ExecutionMetadata>,
}

impl ExecutionResult {
    /// Nothing was executed and nothing came from the cache.
    pub(crate) fn untouched(notebook: Notebook, duration: Duration) -> Self {
        Self {
            notebook,
            state: ExecutionState::Skipped,
            duration,
            error: None,
            artifacts: Vec::new(),
            metadata: None,
        }
    }

    /// Outputs were merged from a cache entry.
    pub(crate) fn cache_hit(
        notebook: Notebook,
        duration: Duration,
        method: ExecutionMode,
        created_at: SystemTime,
        runtime: Option<Duration>,
        artifacts: Vec<PathBuf>,
    ) -> Self {
        Self {
            notebook,
            state: ExecutionState::Skipped,
            duration,
            error: None,
            artifacts,
            metadata: Some(ExecutionMetadata::cached(method, created_at, runtime)),
        }
    }

    /// The notebook ran, to completion or failure.
    pub(crate) fn executed(
        notebook: Notebook,
        duration: Duration,
        method: ExecutionMode,
        runtime: Duration,
        error: Option<ExecutionError>,
        artifacts: Vec<PathBuf>,
    ) -> Self {
        let state = if error.is_some() {
            ExecutionState::Failed
        } else {
            ExecutionState::Completed
        };
        let metadata = ExecutionMetadata::executed(method, runtime, error.as_ref());
        Self {
            notebook,
            state,
            duration,
            error,
            artifacts,
            metadata: Some(metadata),
        }
    }

    /// The notebook with populated outputs.
    pub fn notebook(&self) -> &Notebook {
        &self.notebook
    }

    /// Take the notebook out of the result.
    pub fn into_notebook(self) -> Notebook {
        self.notebook
    }

    /// Split the result into the notebook and the failure, if any.
    pub fn into_parts(self) -> (Notebook, Option<ExecutionError>) {
        (self.notebook, self.error)
    }

    /// `Err` with the failure if the run failed, the result otherwise.
    pub fn into_result(self) -> Result<Self, ExecutionError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }

    /// Final state.
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Wall-clock time spent processing the notebook in this build.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The aborting failure, if the run failed.
    pub fn error(&self) -> Option<&ExecutionError> {
        self.error.as_ref()
    }

    /// Artifact files materialised for this notebook.
    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    /// Execution metadata; `None` when outputs were neither produced nor retrieved.
    pub fn metadata(&self) -> Option<&ExecutionMetadata> {
        self.metadata.as_ref()
    }

    /// Whether the outputs came from the cache.
    pub fn from_cache(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.from_cache)
    }

    /// Whether the kernel ran for this notebook.
    pub fn executed_now(&self) -> bool {
        matches!(self.state, ExecutionState::Completed | ExecutionState::Failed)
    }
}

pub(crate) fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
