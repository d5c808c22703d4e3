//! Top-level entry point: choose a strategy per notebook and run it.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use globset::GlobSet;
use regex::Regex;

use crate::cache::CacheStore;
use crate::config::{ExecutionConfig, ExecutionMode};
use crate::error::{Error, ExecutionError, KernelError, Result};
use crate::execute::{
    ExecutionContext, ExecutionResult, InlineSession, Strategy, WorkDir, execute_cached,
    execute_direct,
};
use crate::kernel::{KernelAliases, KernelProvider};
use crate::notebook::{Cell, Notebook, Output};
use crate::stats::ExecutionStats;

/// Runs notebooks according to an [`ExecutionConfig`].
///
/// Holds no per-notebook state, so one orchestrator can serve many
/// notebooks, including from several threads at once.
pub struct Orchestrator {
    config: ExecutionConfig,
    provider: Arc<dyn KernelProvider>,
    aliases: KernelAliases,
    exclusions: GlobSet,
    eval_names: Regex,
    store: Option<CacheStore>,
    source_root: Option<PathBuf>,
}

impl Orchestrator {
    /// Validate `config` and prepare to execute with kernels from `provider`.
    ///
    /// Opens the cache store when the mode uses one.
    pub fn new(config: ExecutionConfig, provider: Arc<dyn KernelProvider>) -> Result<Self> {
        let aliases = KernelAliases::compile(&config.kernel_aliases)?;
        let exclusions = config.exclusion_set()?;
        let eval_names = config.eval_name_matcher()?;
        let store = match config.mode {
            ExecutionMode::Cache | ExecutionMode::Lazy => {
                Some(CacheStore::open(&config.cache_path)?)
            }
            _ => None,
        };

        Ok(Self {
            config,
            provider,
            aliases,
            exclusions,
            eval_names,
            store,
            source_root: None,
        })
    }

    /// Directory document identities and exclusion patterns are relative to.
    pub fn with_source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = Some(root.into());
        self
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// The cache store, for `cache` and `lazy` modes.
    pub fn cache(&self) -> Option<&CacheStore> {
        self.store.as_ref()
    }

    /// Document identity of the notebook at `path`: its path relative to
    /// the source root, `/`-separated, without extension.
    pub fn document_id(&self, path: &Path) -> String {
        let relative = self.relative(path).with_extension("");
        relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Whether the notebook at `path` matches an exclusion pattern.
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclusions.is_match(self.relative(path)) || self.exclusions.is_match(path)
    }

    /// The strategy `notebook` would be executed with; `None` means its
    /// stored outputs are used as they are.
    pub fn strategy_for(&self, path: &Path, notebook: &Notebook) -> Option<Strategy<'_>> {
        if self.is_excluded(path) {
            return None;
        }
        match self.config.mode {
            ExecutionMode::Off => None,
            ExecutionMode::Force => Some(Strategy::Direct),
            ExecutionMode::Auto => notebook.has_missing_outputs().then_some(Strategy::Direct),
            ExecutionMode::Cache | ExecutionMode::Lazy => {
                self.store.as_ref().map(|store| Strategy::Cached {
                    store,
                    lazy: self.config.mode == ExecutionMode::Lazy,
                })
            }
            ExecutionMode::Inline => Some(Strategy::Inline),
        }
    }

    /// Process `notebook` (read from `path`) and record its statistics.
    ///
    /// Execution failures are returned as an error only when
    /// `raise_on_error` is set; otherwise they are logged and carried in the
    /// result.
    pub fn execute(&self, notebook: Notebook, path: &Path, stats: &mut ExecutionStats) -> Result<ExecutionResult> {
        self.begin(notebook, path)?.finish(stats)
    }

    /// Open a client for `notebook`, to be driven while the document is
    /// rendered. With the `inline` mode cells execute as they are reached;
    /// otherwise the notebook is processed up front.
    pub fn begin(&self, notebook: Notebook, path: &Path) -> Result<NotebookClient<'_>> {
        let started = Instant::now();
        let document = self.document_id(path);

        let Some(strategy) = self.strategy_for(path, &notebook) else {
            let reason = if self.is_excluded(path) {
                "excluded"
            } else {
                "not required"
            };
            tracing::debug!("Using stored outputs for {} (execution {})", document, reason);
            return Ok(NotebookClient {
                orchestrator: self,
                document,
                inner: ClientState::ReadOnly { notebook, started },
            });
        };

        let kernel_name = notebook
            .kernel_name()
            .map(|name| self.aliases.resolve(name).to_string());
        let Some(kernel_name) = kernel_name else {
            let error = ExecutionError {
                document: document.clone(),
                cell_index: None,
                cause: KernelError::Start {
                    kernel: String::new(),
                    reason: "notebook metadata has no kernelspec".to_string(),
                },
            };
            let result = ExecutionResult::executed(
                notebook,
                started.elapsed(),
                self.config.mode,
                started.elapsed(),
                Some(error),
                Vec::new(),
            );
            return Ok(NotebookClient {
                orchestrator: self,
                document,
                inner: ClientState::Finished(result),
            });
        };

        let notebook_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let workdir = if self.config.in_temp {
            WorkDir::temporary()?
        } else {
            WorkDir::in_place(&notebook_dir)
        };
        let artifact_dest = self.config.artifact_dir.clone().unwrap_or(notebook_dir);

        let ctx = ExecutionContext {
            document: document.clone(),
            provider: self.provider.as_ref(),
            config: &self.config,
            kernel_name,
            workdir,
            artifact_dest,
        };

        let inner = match strategy {
            Strategy::Direct => ClientState::Finished(execute_direct(ctx, notebook)),
            Strategy::Cached { store, lazy } => {
                ClientState::Finished(execute_cached(ctx, store, lazy, notebook))
            }
            Strategy::Inline => {
                ClientState::Inline(InlineSession::start(ctx, notebook, &self.eval_names))
            }
        };

        Ok(NotebookClient {
            orchestrator: self,
            document,
            inner,
        })
    }

    fn relative<'p>(&self, path: &'p Path) -> &'p Path {
        self.source_root
            .as_deref()
            .and_then(|root| path.strip_prefix(root).ok())
            .unwrap_or(path)
    }

    /// Record statistics and apply the failure policy.
    fn conclude(&self, document: &str, result: ExecutionResult, stats: &mut ExecutionStats) -> Result<ExecutionResult> {
        if let Some(metadata) = result.metadata() {
            stats.record(document, metadata.clone());
        }

        let Some(error) = result.error() else {
            if result.executed_now() {
                tracing::info!(
                    "Executed {} in {:.2} seconds",
                    document,
                    result.duration().as_secs_f64()
                );
            }
            return Ok(result);
        };

        let traceback = error.traceback().unwrap_or_else(|| error.to_string());
        let mut message = format!("Executing notebook failed: {}", error.cause.kind());
        if let Some(dir) = &self.config.report_dir {
            match write_report(dir, document, &traceback) {
                Ok(path) => message.push_str(&format!(" (see {})", path.display())),
                Err(e) => tracing::warn!("Failed to write execution report for {}: {}", document, e),
            }
        }
        if self.config.show_traceback {
            message.push('\n');
            message.push_str(&traceback);
        }
        tracing::warn!("{}: {}", document, message);

        if self.config.raise_on_error {
            return result.into_result().map_err(Error::from);
        }
        Ok(result)
    }
}

/// Write `traceback` to `<dir>/<document>.err.log`.
fn write_report(dir: &Path, document: &str, traceback: &str) -> io::Result<PathBuf> {
    let path = dir.join(format!("{}.err.log", document));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, traceback)?;
    Ok(path)
}

/// Access to one notebook's outputs while its document is rendered.
pub struct NotebookClient<'o> {
    orchestrator: &'o Orchestrator,
    document: String,
    inner: ClientState<'o>,
}

enum ClientState<'o> {
    /// Outputs are used as stored; nothing executes.
    ReadOnly { notebook: Notebook, started: Instant },
    /// The notebook was fully processed up front.
    Finished(ExecutionResult),
    Inline(InlineSession<'o>),
}

impl NotebookClient<'_> {
    /// Document identity of the notebook.
    pub fn document(&self) -> &str {
        &self.document
    }

    /// The notebook in its current state.
    pub fn notebook(&self) -> &Notebook {
        match &self.inner {
            ClientState::ReadOnly { notebook, .. } => notebook,
            ClientState::Finished(result) => result.notebook(),
            ClientState::Inline(session) => session.notebook(),
        }
    }

    /// Execution count and outputs of the code cell at `index`.
    ///
    /// Returns `None` if `index` is not a code cell.
    pub fn code_cell_outputs(&mut self, index: usize) -> Option<(Option<u32>, &[Output])> {
        let notebook = match &mut self.inner {
            ClientState::Inline(session) => return session.code_cell_outputs(index),
            ClientState::ReadOnly { notebook, .. } => &*notebook,
            ClientState::Finished(result) => result.notebook(),
        };
        match notebook.cells.get(index) {
            Some(Cell::Code(cell)) => Some((cell.execution_count, cell.outputs.as_slice())),
            _ => None,
        }
    }

    /// Evaluate a variable in the running kernel. Only the `inline` mode
    /// keeps a kernel running while the document is rendered.
    pub fn eval_variable(&mut self, name: &str) -> Result<Vec<Output>> {
        match &mut self.inner {
            ClientState::Inline(session) => Ok(session.eval_variable(name)?),
            _ => Err(Error::Unsupported(format!(
                "evaluating '{}' requires execution mode 'inline' (document {} uses '{}')",
                name, self.document, self.orchestrator.config.mode
            ))),
        }
    }

    /// Finish processing, record statistics and apply the failure policy.
    pub fn finish(self, stats: &mut ExecutionStats) -> Result<ExecutionResult> {
        let result = match self.inner {
            ClientState::ReadOnly { notebook, started } => {
                ExecutionResult::untouched(notebook, started.elapsed())
            }
            ClientState::Finished(result) => result,
            ClientState::Inline(session) => session.finish(),
        };
        self.orchestrator.conclude(&self.document, result, stats)
    }
}
