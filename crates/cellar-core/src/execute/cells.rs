//! The per-cell execution loop shared by every strategy.

use std::time::Duration;

use crate::config::ExecutionConfig;
use crate::error::{ExecutionError, KernelError};
use crate::kernel::KernelSession;
use crate::notebook::{
    CodeCell, Notebook, Output, TAG_RAISES_EXCEPTION, TAG_SKIP_EXECUTION, coalesce_streams,
};

/// Error name recorded for a cell that exceeded its timeout.
pub const TIMEOUT_ERROR_NAME: &str = "CellTimeoutError";

/// Effective execution settings for one notebook.
///
/// Notebook metadata overrides the global configuration; cell metadata and
/// tags override both, per cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellPolicy {
    /// Record cell errors and continue.
    pub allow_errors: bool,
    /// Default per-cell timeout.
    pub timeout: Option<Duration>,
    /// Coalesce stream outputs.
    pub merge_streams: bool,
}

impl CellPolicy {
    /// Resolve the policy for `notebook` under `config`.
    pub fn for_notebook(config: &ExecutionConfig, notebook: &Notebook) -> Self {
        let allow_errors = notebook
            .allow_errors_override()
            .unwrap_or(config.allow_errors);
        let timeout = match notebook.timeout_override() {
            Some(secs) => seconds(secs),
            None => config.timeout_duration(),
        };
        Self {
            allow_errors,
            timeout,
            merge_streams: config.merge_streams,
        }
    }

    fn timeout_for(&self, cell: &CodeCell) -> Option<Duration> {
        match cell.metadata.timeout_override() {
            Some(secs) => seconds(secs),
            None => self.timeout,
        }
    }

    fn allows_errors(&self, cell: &CodeCell) -> bool {
        self.allow_errors || cell.metadata.has_tag(TAG_RAISES_EXCEPTION)
    }

    fn merges_streams(&self, cell: &CodeCell) -> bool {
        cell.metadata
            .merge_streams_override()
            .unwrap_or(self.merge_streams)
    }
}

/// Negative timeouts mean "no limit".
fn seconds(secs: i64) -> Option<Duration> {
    u64::try_from(secs).ok().map(Duration::from_secs)
}

/// Reset a notebook before execution.
///
/// Executable cells lose their outputs and counts; `skip-execution` cells
/// keep their outputs but not their counts, since they will not run.
pub(crate) fn prepare(notebook: &mut Notebook) {
    for cell in notebook.code_cells_mut() {
        cell.execution_count = None;
        if !cell.metadata.has_tag(TAG_SKIP_EXECUTION) {
            cell.outputs.clear();
        }
    }
}

/// What happened to one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CellOutcome {
    Executed,
    /// The cell failed but errors were allowed; its error output was kept.
    RecordedError,
    NotExecuted,
}

/// Runs code cells one at a time against a kernel session.
#[derive(Debug)]
pub(crate) struct CellRunner {
    document: String,
    policy: CellPolicy,
    executed: u32,
}

impl CellRunner {
    pub(crate) fn new(document: &str, policy: CellPolicy) -> Self {
        Self {
            document: document.to_string(),
            policy,
            executed: 0,
        }
    }

    pub(crate) fn policy(&self) -> &CellPolicy {
        &self.policy
    }

    /// Run every code cell in document order, stopping at the first
    /// aborting failure.
    pub(crate) fn run_all(&mut self, session: &mut dyn KernelSession, notebook: &mut Notebook) -> Result<(), ExecutionError> {
        let indices: Vec<usize> = notebook.code_cells().map(|(i, _)| i).collect();
        for index in indices {
            self.run(session, notebook, index)?;
        }
        Ok(())
    }

    /// Run the code cell at `index` (into `notebook.cells`).
    ///
    /// The cell's outputs and execution count are replaced together. A
    /// cell-level failure is recorded as an error output on the cell and is
    /// only returned as an error when errors are not allowed for it.
    pub(crate) fn run(
        &mut self,
        session: &mut dyn KernelSession,
        notebook: &mut Notebook,
        index: usize,
    ) -> Result<CellOutcome, ExecutionError> {
        let Some(cell) = notebook.code_cell_mut(index) else {
            return Ok(CellOutcome::NotExecuted);
        };

        if cell.metadata.has_tag(TAG_SKIP_EXECUTION) {
            cell.execution_count = None;
            tracing::debug!(
                "Skipping cell {} of {} (tagged {})",
                index,
                self.document,
                TAG_SKIP_EXECUTION
            );
            return Ok(CellOutcome::NotExecuted);
        }

        let timeout = self.policy.timeout_for(cell);
        let allows_errors = self.policy.allows_errors(cell);
        let merge = self.policy.merges_streams(cell);

        let result = session.execute_cell(&cell.source, timeout);
        self.executed += 1;
        let count = self.executed;

        let (outputs, failure) = match result {
            Ok(outputs) => (outputs, None),
            Err(e) if e.is_cell_level() => (failure_outputs(&e), Some(e)),
            Err(cause) => {
                return Err(ExecutionError {
                    document: self.document.clone(),
                    cell_index: Some(index),
                    cause,
                });
            }
        };

        cell.outputs = finish_outputs(outputs, count, merge);
        cell.execution_count = Some(count);

        match failure {
            None => Ok(CellOutcome::Executed),
            Some(cause) if allows_errors => {
                tracing::debug!(
                    "Cell {} of {} raised {}; continuing",
                    index,
                    self.document,
                    cause.kind()
                );
                Ok(CellOutcome::RecordedError)
            }
            Some(cause) => Err(ExecutionError {
                document: self.document.clone(),
                cell_index: Some(index),
                cause,
            }),
        }
    }
}

/// Outputs to record on a cell that failed.
fn failure_outputs(error: &KernelError) -> Vec<Output> {
    match error {
        KernelError::CellExecution(exc) => {
            let mut outputs = exc.outputs.clone();
            if !outputs.iter().any(Output::is_error) {
                outputs.push(Output::error(
                    exc.ename.clone(),
                    exc.evalue.clone(),
                    exc.traceback.clone(),
                ));
            }
            outputs
        }
        KernelError::CellTimeout { timeout, outputs } => {
            let mut outputs = outputs.clone();
            outputs.push(Output::error(
                TIMEOUT_ERROR_NAME,
                format!(
                    "Cell execution timed out after {} seconds",
                    timeout.as_secs_f64()
                ),
                Vec::new(),
            ));
            outputs
        }
        _ => Vec::new(),
    }
}

fn finish_outputs(outputs: Vec<Output>, count: u32, merge: bool) -> Vec<Output> {
    let mut outputs = if merge {
        coalesce_streams(outputs)
    } else {
        outputs
    };
    for output in &mut outputs {
        if let Output::ExecuteResult {
            execution_count, ..
        } = output
        {
            *execution_count = Some(count);
        }
    }
    outputs
}
