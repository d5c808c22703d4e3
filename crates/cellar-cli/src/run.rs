//! Run command implementation for Cellar CLI.
//!
//! Executes notebooks in parallel, writes the executed documents and stores
//! the build statistics for `cellar report`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use cellar_core::{
    ExecutionConfig, ExecutionResult, ExecutionState, ExecutionStats, KernelProvider,
    KernelRegistry, Notebook, Orchestrator, ProcessKernelProvider,
};
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::colors;
use crate::report;

/// Options that only concern the command line front-end.
pub struct RunOptions {
    pub paths: Vec<PathBuf>,
    pub root: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub jobs: Option<usize>,
}

/// What happened to one notebook.
struct Outcome {
    document: String,
    stats: ExecutionStats,
    result: anyhow::Result<ExecutionResult>,
}

/// Execute all notebooks found under `options.paths`.
pub fn execute(config: ExecutionConfig, options: RunOptions) -> anyhow::Result<()> {
    let start = Instant::now();

    let root = match options.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let root = fs::canonicalize(&root)
        .with_context(|| format!("Source root {} not found", root.display()))?;

    let notebooks = discover(&options.paths)?;
    if notebooks.is_empty() {
        println!("{}No notebooks found.{}", colors::YELLOW, colors::RESET);
        return Ok(());
    }

    let stats_path = report::stats_path(&config.cache_path);
    let registry = KernelRegistry::with_default_paths(&config.kernel_paths);
    let provider: Arc<dyn KernelProvider> = Arc::new(ProcessKernelProvider::new(registry));
    let mode = config.mode;
    let orchestrator = Orchestrator::new(config, provider)?.with_source_root(&root);

    println!(
        "{}Running{} {} notebook(s) {}(mode: {}){}",
        colors::BOLD,
        colors::RESET,
        notebooks.len(),
        colors::DIM,
        mode,
        colors::RESET
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.jobs.unwrap_or(0))
        .build()
        .context("Failed to create worker pool")?;
    let output_dir = options.output_dir.as_deref();
    let outcomes: Vec<Outcome> = pool.install(|| {
        notebooks
            .par_iter()
            .map(|path| run_notebook(&orchestrator, &root, path, output_dir))
            .collect()
    });

    let mut stats = ExecutionStats::new();
    let mut failures = Vec::new();
    for outcome in outcomes {
        print_outcome(&outcome);
        if let Err(e) = &outcome.result {
            failures.push(format!("{}: {:#}", outcome.document, e));
        }
        stats.merge(outcome.stats);
    }

    report::save(&stats, &stats_path)?;
    if !stats.is_empty() {
        println!();
        print!("{}", report::render(&stats));
    }

    let summary = stats.summary();
    println!(
        "\n{}Completed{} in {:.2}s: {} executed, {} from cache, {} failed",
        colors::GREEN,
        colors::RESET,
        start.elapsed().as_secs_f64(),
        summary.executed,
        summary.cached,
        summary.failed
    );

    if !failures.is_empty() {
        anyhow::bail!("{} notebook(s) failed:\n{}", failures.len(), failures.join("\n"));
    }
    Ok(())
}

fn run_notebook(orchestrator: &Orchestrator, root: &Path, path: &Path, output_dir: Option<&Path>) -> Outcome {
    let document = orchestrator.document_id(path);
    let mut stats = ExecutionStats::new();

    let result = Notebook::read_from_file(path)
        .and_then(|notebook| orchestrator.execute(notebook, path, &mut stats))
        .map_err(anyhow::Error::from)
        .and_then(|result| {
            let target = match output_dir {
                Some(dir) => dir.join(path.strip_prefix(root).unwrap_or(path)),
                None => path.to_path_buf(),
            };
            // Untouched notebooks are only copied when writing elsewhere
            if output_dir.is_some() || result.executed_now() || result.from_cache() {
                write_notebook(result.notebook(), &target)?;
            }
            Ok(result)
        });

    Outcome {
        document,
        stats,
        result,
    }
}

fn write_notebook(notebook: &Notebook, target: &Path) -> anyhow::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    notebook
        .write_to_file(target)
        .with_context(|| format!("Failed to write {}", target.display()))
}

fn print_outcome(outcome: &Outcome) {
    match &outcome.result {
        Ok(result) => {
            let (color, label) = match result.state() {
                ExecutionState::Failed => (colors::RED, "failed"),
                _ if result.from_cache() => (colors::CYAN, "cached"),
                ExecutionState::Completed => (colors::GREEN, "executed"),
                _ => (colors::DIM, "unchanged"),
            };
            println!(
                "  {}{:<9}{} {} {}({:.2}s){}",
                color,
                label,
                colors::RESET,
                outcome.document,
                colors::DIM,
                result.duration().as_secs_f64(),
                colors::RESET
            );
        }
        Err(e) => {
            println!(
                "  {}{:<9}{} {}: {}",
                colors::RED,
                "error",
                colors::RESET,
                outcome.document,
                e
            );
        }
    }
}

/// Expand directories into the `.ipynb` files below them, skipping hidden
/// directories such as caches and checkpoints.
fn discover(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut notebooks = Vec::new();
    for path in paths {
        let path = fs::canonicalize(path)
            .with_context(|| format!("Notebook path {} not found", path.display()))?;
        if path.is_file() {
            notebooks.push(path);
            continue;
        }

        let walker = WalkDir::new(&path)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));
        for entry in walker {
            let entry = entry?;
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "ipynb")
            {
                notebooks.push(entry.into_path());
            }
        }
    }
    notebooks.dedup();
    Ok(notebooks)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with('.'))
}
