//! Jupyter notebook (nbformat v4) document model.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Cell tag that excludes a code cell from execution.
pub const TAG_SKIP_EXECUTION: &str = "skip-execution";

/// Cell tag marking a code cell that is expected to raise.
pub const TAG_RAISES_EXCEPTION: &str = "raises-exception";

/// Metadata key holding execution overrides (`timeout`, `allow_errors`).
pub const EXECUTION_METADATA_KEY: &str = "execution";

/// Metadata key holding cellar-specific cell overrides.
pub const CELLAR_METADATA_KEY: &str = "cellar";

/// A MIME bundle: media type to representation.
pub type MimeBundle = BTreeMap<String, Value>;

/// A Jupyter notebook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    /// Notebook metadata
    pub metadata: NotebookMetadata,

    /// Format version (always 4)
    pub nbformat: u32,

    /// Minor format version
    pub nbformat_minor: u32,

    /// Notebook cells
    pub cells: Vec<Cell>,
}

/// Top-level notebook metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotebookMetadata {
    /// Kernel specification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernelspec: Option<KernelSpecInfo>,

    /// Language info reported by the kernel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_info: Option<Value>,

    /// Everything else (titles, jupytext headers, execution overrides, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Kernel identity recorded in the notebook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpecInfo {
    /// Kernel name
    pub name: String,

    /// Display name
    #[serde(default)]
    pub display_name: String,

    /// Language
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// A notebook cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cell_type", rename_all = "lowercase")]
pub enum Cell {
    /// Executable code cell
    Code(CodeCell),
    /// Markdown text
    Markdown(TextCell),
    /// Raw text, passed through unrendered
    Raw(TextCell),
}

/// A code cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeCell {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub metadata: CellMetadata,

    #[serde(with = "multiline")]
    pub source: String,

    /// Set iff the cell ran in the current execution.
    #[serde(default)]
    pub execution_count: Option<u32>,

    #[serde(default)]
    pub outputs: Vec<Output>,
}

/// A markdown or raw cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextCell {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub metadata: CellMetadata,

    #[serde(with = "multiline")]
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Value>,
}

/// Free-form cell metadata with typed accessors for the keys we act on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellMetadata(pub Map<String, Value>);

impl CellMetadata {
    /// Tags attached to the cell.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.0
            .get("tags")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
    }

    /// Check whether the cell carries `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags().any(|t| t == tag)
    }

    /// Add a tag if not already present.
    pub fn add_tag(&mut self, tag: &str) {
        if self.has_tag(tag) {
            return;
        }
        let tags = self
            .0
            .entry("tags")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = tags {
            list.push(Value::String(tag.to_string()));
        }
    }

    /// Per-cell timeout override, in seconds.
    ///
    /// Negative values mean "no limit", same as the global setting.
    pub fn timeout_override(&self) -> Option<i64> {
        self.0
            .get(EXECUTION_METADATA_KEY)
            .and_then(|v| v.get("timeout"))
            .and_then(Value::as_i64)
    }

    /// Per-cell `merge_streams` override.
    pub fn merge_streams_override(&self) -> Option<bool> {
        self.0
            .get(CELLAR_METADATA_KEY)
            .and_then(|v| v.get("merge_streams"))
            .and_then(Value::as_bool)
    }
}

/// Stream channel of a `stream` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Cell output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    /// Standard output/error
    Stream {
        name: StreamName,
        #[serde(with = "multiline")]
        text: String,
    },

    /// Rich display data
    DisplayData {
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
    },

    /// Value of the last expression
    ExecuteResult {
        #[serde(default)]
        execution_count: Option<u32>,
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
    },

    /// Error output
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl Output {
    /// A stdout stream output.
    pub fn stdout(text: impl Into<String>) -> Self {
        Output::Stream {
            name: StreamName::Stdout,
            text: text.into(),
        }
    }

    /// A stderr stream output.
    pub fn stderr(text: impl Into<String>) -> Self {
        Output::Stream {
            name: StreamName::Stderr,
            text: text.into(),
        }
    }

    /// An error output.
    pub fn error(ename: impl Into<String>, evalue: impl Into<String>, traceback: Vec<String>) -> Self {
        Output::Error {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback,
        }
    }

    /// Check if this is an error output.
    pub fn is_error(&self) -> bool {
        matches!(self, Output::Error { .. })
    }
}

impl Notebook {
    /// Create a new empty notebook.
    pub fn new() -> Self {
        Self {
            metadata: NotebookMetadata::default(),
            nbformat: 4,
            nbformat_minor: 5,
            cells: Vec::new(),
        }
    }

    /// Create a notebook with the given kernel and code cell sources.
    pub fn with_code_cells<I, S>(kernel: &str, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut notebook = Self::new();
        notebook.metadata.kernelspec = Some(KernelSpecInfo {
            name: kernel.to_string(),
            display_name: kernel.to_string(),
            language: None,
        });
        notebook.cells = sources
            .into_iter()
            .map(|s| {
                Cell::Code(CodeCell {
                    source: s.into(),
                    ..Default::default()
                })
            })
            .collect();
        notebook
    }

    /// Parse a notebook from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read a notebook from a file.
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| Error::NotebookRead {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| Error::NotebookRead {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Write the notebook to a file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Kernel name recorded in the metadata, if any.
    pub fn kernel_name(&self) -> Option<&str> {
        self.metadata.kernelspec.as_ref().map(|k| k.name.as_str())
    }

    /// Iterate code cells with their index into `cells`.
    pub fn code_cells(&self) -> impl Iterator<Item = (usize, &CodeCell)> {
        self.cells.iter().enumerate().filter_map(|(i, c)| match c {
            Cell::Code(code) => Some((i, code)),
            _ => None,
        })
    }

    /// Iterate code cells mutably.
    pub fn code_cells_mut(&mut self) -> impl Iterator<Item = &mut CodeCell> {
        self.cells.iter_mut().filter_map(|c| match c {
            Cell::Code(code) => Some(code),
            _ => None,
        })
    }

    /// Code cell at `index` into `cells`, if that cell is a code cell.
    pub fn code_cell_mut(&mut self, index: usize) -> Option<&mut CodeCell> {
        match self.cells.get_mut(index) {
            Some(Cell::Code(code)) => Some(code),
            _ => None,
        }
    }

    /// Ordered sources of all code cells.
    pub fn code_sources(&self) -> Vec<&str> {
        self.code_cells().map(|(_, c)| c.source.as_str()).collect()
    }

    /// Whether at least one code cell has no outputs.
    pub fn has_missing_outputs(&self) -> bool {
        self.code_cells().any(|(_, c)| c.outputs.is_empty())
    }

    /// Drop outputs and execution counts of every code cell.
    pub fn clear_outputs(&mut self) {
        for cell in self.code_cells_mut() {
            cell.outputs.clear();
            cell.execution_count = None;
        }
    }

    /// Notebook-level `allow_errors` override.
    pub fn allow_errors_override(&self) -> Option<bool> {
        self.execution_metadata()
            .and_then(|v| v.get("allow_errors"))
            .and_then(Value::as_bool)
    }

    /// Notebook-level timeout override, in seconds.
    pub fn timeout_override(&self) -> Option<i64> {
        self.execution_metadata()
            .and_then(|v| v.get("timeout"))
            .and_then(Value::as_i64)
    }

    fn execution_metadata(&self) -> Option<&Value> {
        self.metadata.extra.get(EXECUTION_METADATA_KEY)
    }
}

impl Default for Notebook {
    fn default() -> Self {
        Self::new()
    }
}

/// nbformat allows multiline strings as either a string or a list of lines.
mod multiline {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Multiline {
        Text(String),
        Lines(Vec<String>),
    }

    pub fn serialize<S: Serializer>(text: &str, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(text.split_inclusive('\n'))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(match Multiline::deserialize(deserializer)? {
            Multiline::Text(text) => text,
            Multiline::Lines(lines) => lines.concat(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"{
        "metadata": {
            "kernelspec": {"name": "python3", "display_name": "Python 3", "language": "python"},
            "title": "Sample"
        },
        "nbformat": 4,
        "nbformat_minor": 5,
        "cells": [
            {"cell_type": "markdown", "metadata": {}, "source": ["# Title\n", "text"]},
            {"cell_type": "code", "metadata": {"tags": ["raises-exception"]},
             "source": "raise ValueError('x')", "execution_count": 3,
             "outputs": [
                {"output_type": "stream", "name": "stdout", "text": ["a\n", "b\n"]},
                {"output_type": "execute_result", "execution_count": 3,
                 "data": {"text/plain": "1"}, "metadata": {}},
                {"output_type": "error", "ename": "ValueError", "evalue": "x", "traceback": []}
             ]}
        ]
    }"##;

    #[test]
    fn test_parse_sample() {
        let nb = Notebook::from_json(SAMPLE).unwrap();
        assert_eq!(nb.kernel_name(), Some("python3"));
        assert_eq!(nb.cells.len(), 2);
        assert_eq!(nb.metadata.extra.get("title"), Some(&Value::from("Sample")));

        let (index, code) = nb.code_cells().next().unwrap();
        assert_eq!(index, 1);
        assert!(code.metadata.has_tag(TAG_RAISES_EXCEPTION));
        assert_eq!(code.outputs[0], Output::stdout("a\nb\n"));
        assert!(code.outputs[2].is_error());
    }

    #[test]
    fn test_source_serialized_as_lines() {
        let nb = Notebook::with_code_cells("python3", ["a = 1\nb = 2"]);
        let json = serde_json::to_value(&nb).unwrap();
        assert_eq!(
            json["cells"][0]["source"],
            serde_json::json!(["a = 1\n", "b = 2"])
        );
        assert_eq!(json["cells"][0]["cell_type"], "code");
    }

    #[test]
    fn test_missing_outputs_and_clear() {
        let mut nb = Notebook::from_json(SAMPLE).unwrap();
        assert!(!nb.has_missing_outputs());

        nb.clear_outputs();
        assert!(nb.has_missing_outputs());
        let (_, code) = nb.code_cells().next().unwrap();
        assert!(code.execution_count.is_none());
    }

    #[test]
    fn test_metadata_overrides() {
        let mut nb = Notebook::new();
        nb.metadata.extra.insert(
            EXECUTION_METADATA_KEY.to_string(),
            serde_json::json!({"allow_errors": true, "timeout": 5}),
        );
        assert_eq!(nb.allow_errors_override(), Some(true));
        assert_eq!(nb.timeout_override(), Some(5));

        let mut meta = CellMetadata::default();
        meta.add_tag(TAG_SKIP_EXECUTION);
        meta.add_tag(TAG_SKIP_EXECUTION);
        assert_eq!(meta.tags().count(), 1);
        assert_eq!(meta.timeout_override(), None);
    }
}
