//! Execution statistics report.
//!
//! `cellar run` stores the statistics of each build next to the cache so the
//! table can be printed again later with `cellar report`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use cellar_core::{ExecutionMetadata, ExecutionStats};
use chrono::{DateTime, Local};

/// File holding the statistics of the last run, inside the cache directory.
pub const STATS_FILE: &str = "stats.json";

const HEADERS: [&str; 5] = ["Document", "Modified", "Method", "Run Time (s)", "Status"];

pub fn stats_path(cache_path: &Path) -> PathBuf {
    cache_path.join(STATS_FILE)
}

/// Print the statistics stored under `cache_path`.
pub fn execute(cache_path: &Path) -> anyhow::Result<()> {
    let path = stats_path(cache_path);
    if !path.is_file() {
        println!("No execution statistics found in {}", cache_path.display());
        return Ok(());
    }
    let stats = load(&path)?;
    print!("{}", render(&stats));
    Ok(())
}

pub fn save(stats: &ExecutionStats, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(stats)?;
    fs::write(path, json)
        .with_context(|| format!("Failed to write statistics to {}", path.display()))
}

pub fn load(path: &Path) -> anyhow::Result<ExecutionStats> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read statistics from {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid statistics file {}", path.display()))
}

/// Render the statistics as a table, one row per document.
pub fn render(stats: &ExecutionStats) -> String {
    let rows: Vec<[String; 5]> = stats.iter().map(|(doc, meta)| row(doc, meta)).collect();

    let mut widths = HEADERS.map(|h| h.chars().count());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    push_line(&mut out, &HEADERS.map(str::to_string), &widths);
    push_line(&mut out, &widths.map(|w| "-".repeat(w)), &widths);
    for row in &rows {
        push_line(&mut out, row, &widths);
    }
    out
}

fn row(document: &str, meta: &ExecutionMetadata) -> [String; 5] {
    let modified = DateTime::from_timestamp(meta.mtime.trunc() as i64, 0)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    let runtime = meta
        .runtime
        .map(|secs| format!("{:.2}", secs))
        .unwrap_or_else(|| "-".to_string());
    let status = if meta.succeeded { "✅" } else { "❌" };

    [
        document.to_string(),
        modified,
        meta.method.to_string(),
        runtime,
        status.to_string(),
    ]
}

fn push_line(out: &mut String, cells: &[String; 5], widths: &[usize; 5]) {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = width))
        .collect();
    out.push_str(padded.join(" | ").trim_end());
    out.push('\n');
}
