//! Per-build execution statistics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::execute::ExecutionMetadata;

/// Statistics collected over one build, keyed by document identity.
///
/// Owned by the host: cleared at the start of a build, filled by
/// [`Orchestrator`](crate::Orchestrator) as notebooks are processed, and
/// handed to the reporting step at the end. Parallel workers each keep
/// their own collector and [`merge`](Self::merge) them afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionStats {
    records: BTreeMap<String, ExecutionMetadata>,
}

/// Totals over a set of statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSummary {
    /// Notebooks executed in this build.
    pub executed: usize,
    /// Notebooks served from the cache.
    pub cached: usize,
    /// Notebooks whose execution failed.
    pub failed: usize,
    /// Sum of recorded run times, in seconds.
    pub runtime: f64,
}

impl ExecutionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything, e.g. at the start of a build.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Record the outcome for `document`, replacing any earlier record.
    pub fn record(&mut self, document: impl Into<String>, metadata: ExecutionMetadata) {
        self.records.insert(document.into(), metadata);
    }

    pub fn get(&self, document: &str) -> Option<&ExecutionMetadata> {
        self.records.get(document)
    }

    /// Records sorted by document.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExecutionMetadata)> {
        self.records.iter().map(|(doc, meta)| (doc.as_str(), meta))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Move all records of `other` into `self`; `other` wins on conflicts.
    pub fn merge(&mut self, other: ExecutionStats) {
        self.records.extend(other.records);
    }

    /// Documents whose execution failed.
    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.iter()
            .filter(|(_, meta)| !meta.succeeded)
            .map(|(doc, _)| doc)
    }

    pub fn summary(&self) -> StatsSummary {
        let mut summary = StatsSummary::default();
        for meta in self.records.values() {
            if meta.from_cache {
                summary.cached += 1;
            } else {
                summary.executed += 1;
            }
            if !meta.succeeded {
                summary.failed += 1;
            }
            summary.runtime += meta.runtime.unwrap_or(0.0);
        }
        summary
    }
}
