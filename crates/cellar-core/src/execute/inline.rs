//! Inline execution: cells run lazily while the document is traversed.

use std::time::Instant;

use regex::Regex;

use super::{CellPolicy, CellRunner, ExecutionContext, ExecutionResult, prepare};
use crate::error::{ExecutionError, KernelError};
use crate::kernel::KernelGuard;
use crate::notebook::{Cell, Notebook, Output};

/// A notebook being executed one traversal step at a time.
///
/// The renderer asks for a cell's outputs when it reaches that cell; every
/// code cell up to and including it is executed first. Between cells it may
/// evaluate variables in the live kernel. After the first aborting failure
/// no further cells run.
pub struct InlineSession<'a> {
    ctx: ExecutionContext<'a>,
    notebook: Notebook,
    kernel: Option<KernelGuard>,
    runner: CellRunner,
    eval_names: &'a Regex,
    code_indices: Vec<usize>,
    next: usize,
    started: Instant,
    error: Option<ExecutionError>,
}

impl<'a> InlineSession<'a> {
    /// Start the kernel for `notebook`. Nothing is executed yet.
    ///
    /// A kernel start failure does not error here; it is reported by
    /// [`finish`](Self::finish) and no cell executes.
    pub fn start(ctx: ExecutionContext<'a>, mut notebook: Notebook, eval_names: &'a Regex) -> Self {
        let started = Instant::now();
        prepare(&mut notebook);

        let policy = CellPolicy::for_notebook(ctx.config, &notebook);
        let runner = CellRunner::new(&ctx.document, policy);
        let code_indices = notebook.code_cells().map(|(i, _)| i).collect();

        tracing::debug!("Starting inline execution of {}", ctx.document);
        let (kernel, error) = match ctx.start_kernel(&mut notebook) {
            Ok(kernel) => (Some(kernel), None),
            Err(e) => (None, Some(e)),
        };

        Self {
            ctx,
            notebook,
            kernel,
            runner,
            eval_names,
            code_indices,
            next: 0,
            started,
            error,
        }
    }

    /// The notebook in its current, partially executed state.
    pub fn notebook(&self) -> &Notebook {
        &self.notebook
    }

    /// Execution count and outputs of the cell at `index`, executing every
    /// pending code cell up to and including it first.
    ///
    /// Returns `None` if `index` is not a code cell.
    pub fn code_cell_outputs(&mut self, index: usize) -> Option<(Option<u32>, &[Output])> {
        self.advance_to(index);
        match self.notebook.cells.get(index) {
            Some(Cell::Code(cell)) => Some((cell.execution_count, cell.outputs.as_slice())),
            _ => None,
        }
    }

    /// Evaluate `name` in the kernel and return the resulting outputs.
    ///
    /// Names not matching the configured regex, and names the kernel cannot
    /// resolve, fail with [`KernelError::EvalName`]. That failure is a warning
    /// for the caller to render, never an aborting error.
    pub fn eval_variable(&mut self, name: &str) -> Result<Vec<Output>, KernelError> {
        if !self.eval_names.is_match(name) {
            tracing::warn!("{}: invalid name for evaluation: {:?}", self.ctx.document, name);
            return Err(KernelError::EvalName(name.to_string()));
        }

        let Some(kernel) = self.kernel.as_mut() else {
            return Err(KernelError::Communication(
                "kernel is not running".to_string(),
            ));
        };

        let unresolved = |detail: String| {
            tracing::warn!(
                "{}: could not evaluate {:?}: {}",
                self.ctx.document,
                name,
                detail
            );
            KernelError::EvalName(name.to_string())
        };

        match kernel.evaluate(name, self.runner.policy().timeout) {
            Ok(outputs) => match outputs.iter().find(|o| o.is_error()) {
                Some(Output::Error { ename, evalue, .. }) => {
                    Err(unresolved(format!("{}: {}", ename, evalue)))
                }
                _ => Ok(outputs),
            },
            Err(KernelError::CellExecution(exc)) => Err(unresolved(exc.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Execute any remaining cells, stop the kernel and produce the result.
    pub fn finish(mut self) -> ExecutionResult {
        self.advance_to(usize::MAX);
        let runtime = self.started.elapsed();

        if let Some(kernel) = self.kernel.take()
            && let Err(e) = kernel.close()
        {
            tracing::warn!("Failed to shut down kernel for {}: {}", self.ctx.document, e);
        }
        tracing::debug!("Stopped inline execution of {}", self.ctx.document);

        let (_, artifacts) = self.ctx.collect_artifacts();
        ExecutionResult::executed(
            self.notebook,
            runtime,
            self.ctx.config.mode,
            runtime,
            self.error,
            artifacts,
        )
    }

    fn advance_to(&mut self, index: usize) {
        while self.error.is_none() && self.next < self.code_indices.len() {
            let cell_index = self.code_indices[self.next];
            if cell_index > index {
                break;
            }
            self.next += 1;

            let Some(kernel) = self.kernel.as_mut() else {
                break;
            };
            if let Err(e) = self.runner.run(&mut **kernel, &mut self.notebook, cell_index) {
                if matches!(e.cause, KernelError::Communication(_)) {
                    prepare(&mut self.notebook);
                }
                self.error = Some(e);
            }
        }
    }
}
