//! Cached execution: reuse stored outputs when the code is unchanged.

use std::path::{Path, PathBuf};
use std::time::Instant;

use super::{CellPolicy, ExecutionContext, ExecutionResult, run_notebook};
use crate::cache::{CacheEntry, CacheStore, PendingEntry};
use crate::error::CacheError;
use crate::fingerprint::{FingerprintKey, FingerprintSettings};
use crate::notebook::{Notebook, TAG_SKIP_EXECUTION};

/// Execute `notebook` unless `store` already holds its outputs.
///
/// The fingerprint is computed before anything runs. On a hit the cached
/// outputs are merged into `notebook` positionally and the entry's artifacts
/// are copied out. On a miss the notebook is executed and, if it completed,
/// stored. A failed run is never stored.
///
/// With `lazy`, a miss only executes when some code cell lacks outputs.
pub fn execute_cached(
    ctx: ExecutionContext<'_>,
    store: &CacheStore,
    lazy: bool,
    mut notebook: Notebook,
) -> ExecutionResult {
    let started = Instant::now();
    let policy = CellPolicy::for_notebook(ctx.config, &notebook);
    let key = FingerprintKey::for_notebook(
        &notebook,
        &ctx.kernel_name,
        FingerprintSettings {
            allow_errors: policy.allow_errors,
        },
    );

    match store.get(&key) {
        Some(entry) => match restore(store, &entry, &notebook, &ctx.artifact_dest) {
            Ok((merged, artifacts)) => {
                tracing::info!("Using cached notebook for {}: {}", ctx.document, key);
                return ExecutionResult::cache_hit(
                    merged,
                    started.elapsed(),
                    ctx.config.mode,
                    entry.created_at,
                    entry.runtime,
                    artifacts,
                );
            }
            Err(e) => {
                tracing::info!(
                    "Cached notebook for {} is unusable ({}); executing",
                    ctx.document,
                    e
                );
            }
        },
        None => tracing::debug!("Cache miss for {}: {}", ctx.document, key),
    }

    if lazy && !notebook.has_missing_outputs() {
        tracing::debug!(
            "{} has outputs for every cell; not executing",
            ctx.document
        );
        return ExecutionResult::untouched(notebook, started.elapsed());
    }

    let outcome = run_notebook(&ctx, &mut notebook);
    let (produced, artifacts) = ctx.collect_artifacts();

    if outcome.error.is_none() {
        let pending = PendingEntry {
            notebook: &notebook,
            runtime: Some(outcome.runtime),
            artifact_root: ctx.workdir.path(),
            artifacts: &produced,
        };
        match store.put(&key, pending) {
            Ok(()) => tracing::debug!("Cached executed notebook {}: {}", ctx.document, key),
            Err(e) => tracing::warn!("Failed to cache {}: {}", ctx.document, e),
        }
    }

    ExecutionResult::executed(
        notebook,
        started.elapsed(),
        ctx.config.mode,
        outcome.runtime,
        outcome.error,
        artifacts,
    )
}

/// Merge `entry` into a copy of `notebook` and materialise its artifacts.
fn restore(
    store: &CacheStore,
    entry: &CacheEntry,
    notebook: &Notebook,
    artifact_dest: &Path,
) -> Result<(Notebook, Vec<PathBuf>), CacheError> {
    let mut merged = notebook.clone();
    merge_outputs(&mut merged, &entry.notebook)?;
    let artifacts = store.copy_artifacts(entry, artifact_dest)?;
    Ok((merged, artifacts))
}

/// Copy outputs and execution counts of `cached` into `notebook`, code cell
/// by code cell.
///
/// A differing number of code cells is reported as an error so the caller
/// treats the entry as a miss. `skip-execution` cells keep their own outputs.
pub(crate) fn merge_outputs(notebook: &mut Notebook, cached: &Notebook) -> Result<(), CacheError> {
    let cached_cells: Vec<_> = cached.code_cells().map(|(_, c)| c).collect();
    let expected = notebook.code_cells().count();
    if cached_cells.len() != expected {
        return Err(CacheError::Corrupt(format!(
            "cached notebook has {} code cells, expected {}",
            cached_cells.len(),
            expected
        )));
    }

    for (cell, cached) in notebook.code_cells_mut().zip(cached_cells) {
        if cell.metadata.has_tag(TAG_SKIP_EXECUTION) {
            cell.execution_count = None;
            continue;
        }
        cell.outputs = cached.outputs.clone();
        cell.execution_count = cached.execution_count;
    }

    if cached.metadata.language_info.is_some() {
        notebook.metadata.language_info = cached.metadata.language_info.clone();
    }
    Ok(())
}
