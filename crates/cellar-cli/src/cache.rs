//! Cache housekeeping commands.

use std::path::Path;

use anyhow::Context;
use cellar_core::CacheStore;
use chrono::{DateTime, Local};

use crate::colors;

/// Print one line per cache entry, oldest first.
pub fn list(cache_path: &Path) -> anyhow::Result<()> {
    let store = open(cache_path)?;
    let entries = store.entries()?;
    if entries.is_empty() {
        println!("Cache at {} is empty", cache_path.display());
        return Ok(());
    }

    println!(
        "{}{} entries in {}{}",
        colors::BOLD,
        entries.len(),
        cache_path.display(),
        colors::RESET
    );
    for entry in &entries {
        let created: DateTime<Local> = entry.created_at.into();
        let runtime = entry
            .runtime
            .map(|d| format!("{:.2}s", d.as_secs_f64()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}{}{}  {}  {:>8}  {} code cells, {} artifacts",
            colors::CYAN,
            &entry.key.to_hex()[..16],
            colors::RESET,
            created.format("%Y-%m-%d %H:%M"),
            runtime,
            entry.notebook.code_cells().count(),
            entry.artifacts.len()
        );
    }
    Ok(())
}

/// Remove every entry.
pub fn clear(cache_path: &Path) -> anyhow::Result<()> {
    let store = open(cache_path)?;
    let removed = store.clear()?;
    println!(
        "{}Removed{} {} cache entries from {}",
        colors::GREEN,
        colors::RESET,
        removed,
        cache_path.display()
    );
    Ok(())
}

fn open(cache_path: &Path) -> anyhow::Result<CacheStore> {
    CacheStore::open(cache_path)
        .with_context(|| format!("Failed to open cache at {}", cache_path.display()))
}
