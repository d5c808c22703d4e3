//! Direct execution: run every time, persist nothing.

use std::time::Instant;

use super::{ExecutionContext, ExecutionResult, run_notebook};
use crate::notebook::Notebook;

/// Execute `notebook` from scratch.
///
/// Existing outputs are replaced. Failures are reported in the result, never
/// as an `Err`, so the caller decides whether they are fatal.
pub fn execute_direct(ctx: ExecutionContext<'_>, mut notebook: Notebook) -> ExecutionResult {
    let started = Instant::now();
    let outcome = run_notebook(&ctx, &mut notebook);
    let (_, artifacts) = ctx.collect_artifacts();

    ExecutionResult::executed(
        notebook,
        started.elapsed(),
        ctx.config.mode,
        outcome.runtime,
        outcome.error,
        artifacts,
    )
}
