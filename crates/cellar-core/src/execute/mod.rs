//! Execution strategies.
//!
//! All strategies share one per-cell loop ([`CellRunner`]) and the state
//! machine in [`ExecutionState`]; they differ in what surrounds it:
//!
//! - [`Strategy::Direct`] executes every time and persists nothing.
//! - [`Strategy::Cached`] looks the notebook up by fingerprint first and
//!   stores successful runs.
//! - [`Strategy::Inline`] executes cell by cell as the caller walks the
//!   document, allowing variable evaluation between cells.

mod cached;
mod cells;
mod direct;
mod inline;
mod result;
mod state;
mod workdir;

pub use cached::execute_cached;
pub use cells::{CellPolicy, TIMEOUT_ERROR_NAME};
pub use direct::execute_direct;
pub use inline::InlineSession;
pub use result::{ExecutionMetadata, ExecutionResult};
pub use state::ExecutionState;
pub use workdir::WorkDir;

pub(crate) use cells::{CellRunner, prepare};

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::cache::CacheStore;
use crate::config::ExecutionConfig;
use crate::error::{ExecutionError, KernelError};
use crate::kernel::{KernelGuard, KernelLaunch, KernelProvider};
use crate::notebook::Notebook;

/// The execution strategy chosen for a notebook.
#[derive(Debug, Clone, Copy)]
pub enum Strategy<'s> {
    Direct,
    Cached {
        store: &'s CacheStore,
        /// On a miss, only execute when some code cell lacks outputs.
        lazy: bool,
    },
    Inline,
}

/// Everything a strategy needs besides the notebook itself.
pub struct ExecutionContext<'a> {
    /// Document identity, used in logs, errors and statistics.
    pub document: String,
    /// Starts kernels.
    pub provider: &'a dyn KernelProvider,
    /// Global configuration.
    pub config: &'a ExecutionConfig,
    /// Kernel name after alias resolution.
    pub kernel_name: String,
    /// Where the kernel runs. Dropped (and cleaned up) with the context.
    pub workdir: WorkDir,
    /// Where produced and cached artifacts are materialised.
    pub artifact_dest: PathBuf,
}

impl ExecutionContext<'_> {
    /// Start the kernel and record its language info in `notebook`.
    pub(crate) fn start_kernel(&self, notebook: &mut Notebook) -> Result<KernelGuard, ExecutionError> {
        let launch = KernelLaunch {
            kernel_name: &self.kernel_name,
            cwd: self.workdir.path(),
        };
        let kernel = KernelGuard::start(self.provider, &launch).map_err(|cause| ExecutionError {
            document: self.document.clone(),
            cell_index: None,
            cause,
        })?;

        match kernel.language_info() {
            Some(info) => notebook.metadata.language_info = Some(info.clone()),
            None => tracing::debug!("Kernel '{}' reported no language info", self.kernel_name),
        }
        Ok(kernel)
    }

    /// Copy files produced by the execution to the artifact destination.
    /// Returns the relative and the exported paths.
    pub(crate) fn collect_artifacts(&self) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let produced = match self.workdir.produced_files() {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(
                    "Failed to list files produced by {} in {}: {}",
                    self.document,
                    self.workdir.path().display(),
                    e
                );
                Vec::new()
            }
        };
        let exported = self.workdir.export(&produced, &self.artifact_dest);
        (produced, exported)
    }
}

/// Outcome of running every cell of a notebook once.
#[derive(Debug)]
pub(crate) struct RunOutcome {
    pub runtime: Duration,
    pub error: Option<ExecutionError>,
}

/// Execute all code cells of `notebook` in a fresh kernel.
///
/// The kernel is shut down on every path. A broken kernel connection
/// discards every output produced so far.
pub(crate) fn run_notebook(ctx: &ExecutionContext<'_>, notebook: &mut Notebook) -> RunOutcome {
    let started = Instant::now();
    prepare(notebook);

    let policy = CellPolicy::for_notebook(ctx.config, notebook);
    let mut runner = CellRunner::new(&ctx.document, policy);

    tracing::debug!(
        "Executing {} in {} CWD {}",
        ctx.document,
        if ctx.workdir.is_temporary() {
            "temporary"
        } else {
            "local"
        },
        ctx.workdir.path().display()
    );

    let error = match ctx.start_kernel(notebook) {
        Ok(mut kernel) => {
            let result = runner.run_all(&mut *kernel, notebook);
            if let Err(e) = kernel.close() {
                tracing::warn!("Failed to shut down kernel for {}: {}", ctx.document, e);
            }
            result.err()
        }
        Err(e) => Some(e),
    };

    if let Some(e) = &error
        && matches!(e.cause, KernelError::Communication(_))
    {
        prepare(notebook);
    }

    RunOutcome {
        runtime: started.elapsed(),
        error,
    }
}
