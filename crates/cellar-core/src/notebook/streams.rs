//! Stream output coalescing.
//!
//! Kernels flush stdout/stderr in arbitrary chunks, so the same program can
//! produce a different number of stream outputs from run to run. Merging
//! them makes the rendered output deterministic.

use std::sync::LazyLock;

use regex::Regex;
use rustc_hash::FxHashMap;

use super::model::{Output, StreamName};

/// Anything up to a carriage return that is not followed by a newline.
static CARRIAGE_RETURN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r".*\r([^\n])").expect("static regex"));

/// A non-newline character followed by a backspace.
static BACKSPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\n]\x08").expect("static regex"));

/// Merge stream outputs sharing a stream name into the first one of that name.
///
/// Each merged stream is normalised to end in a single newline, `\b` and `\r`
/// control characters are applied, and a `stderr` stream directly followed by
/// a `stdout` stream is swapped so stdout comes first.
pub fn coalesce_streams(outputs: Vec<Output>) -> Vec<Output> {
    if outputs.is_empty() {
        return outputs;
    }

    let mut merged: Vec<Output> = Vec::with_capacity(outputs.len());
    let mut first_index: FxHashMap<StreamName, usize> = FxHashMap::default();

    for output in outputs {
        match output {
            Output::Stream { name, text } => match first_index.get(&name) {
                Some(&idx) => {
                    let extra = text.trim_end();
                    if !extra.is_empty()
                        && let Output::Stream { text: existing, .. } = &mut merged[idx]
                    {
                        existing.push_str(extra);
                        existing.push('\n');
                    }
                }
                None => {
                    first_index.insert(name, merged.len());
                    merged.push(Output::Stream {
                        name,
                        text: format!("{}\n", text.trim_end()),
                    });
                }
            },
            other => merged.push(other),
        }
    }

    for &idx in first_index.values() {
        if let Output::Stream { text, .. } = &mut merged[idx] {
            *text = apply_control_chars(text);
        }
    }

    // stdout and stderr race each other; pin their relative order.
    let mut i = 0;
    while i + 1 < merged.len() {
        if is_stream(&merged[i], StreamName::Stderr) && is_stream(&merged[i + 1], StreamName::Stdout) {
            merged.swap(i, i + 1);
        }
        i += 1;
    }

    merged
}

fn is_stream(output: &Output, stream: StreamName) -> bool {
    matches!(output, Output::Stream { name, .. } if *name == stream)
}

fn apply_control_chars(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = BACKSPACE.replace_all(&current, "").into_owned();
        if next.len() == current.len() {
            break;
        }
        current = next;
    }
    CARRIAGE_RETURN.replace_all(&current, "$1").into_owned()
}
