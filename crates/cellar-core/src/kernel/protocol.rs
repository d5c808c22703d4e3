//! Wire protocol between the engine and kernel processes.
//!
//! Newline-delimited JSON over the kernel's stdin/stdout. Each `execute`
//! request is answered by zero or more output messages followed by exactly
//! one `idle` message.

use std::io::{BufRead, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::KernelError;
use crate::notebook::{MimeBundle, Output, StreamName};

/// Upper bound on a single message line (100MB).
const MAX_MESSAGE_LEN: u64 = 100 * 1024 * 1024;

/// Command sent from the engine to a kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelCommand {
    /// Ask for the kernel's language info. Also serves as a liveness check.
    KernelInfo,

    /// Run source code.
    Execute {
        /// Code to run.
        source: String,
        /// Silent requests do not bump the execution counter or history.
        #[serde(default)]
        silent: bool,
    },

    /// Shutdown the kernel gracefully.
    Shutdown,
}

/// Completion status carried by `idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Message sent from a kernel to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelMessage {
    /// Reply to `kernel_info`.
    KernelInfo {
        #[serde(default)]
        language_info: Value,
    },

    /// Text written to stdout/stderr.
    Stream { name: StreamName, text: String },

    /// Rich display output.
    DisplayData {
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
    },

    /// Value of the last expression.
    ExecuteResult {
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(default)]
        execution_count: Option<u32>,
    },

    /// An exception was raised.
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },

    /// The request finished.
    Idle {
        status: ReplyStatus,
        #[serde(default)]
        execution_count: Option<u32>,
    },

    /// Acknowledgement of shutdown request.
    ShuttingDown,
}

impl KernelMessage {
    /// Convert an output-carrying message into a notebook output.
    pub fn into_output(self) -> Option<Output> {
        match self {
            KernelMessage::Stream { name, text } => Some(Output::Stream { name, text }),
            KernelMessage::DisplayData { data, metadata } => {
                Some(Output::DisplayData { data, metadata })
            }
            KernelMessage::ExecuteResult {
                data,
                metadata,
                execution_count,
            } => Some(Output::ExecuteResult {
                execution_count,
                data,
                metadata,
            }),
            KernelMessage::Error {
                ename,
                evalue,
                traceback,
            } => Some(Output::Error {
                ename,
                evalue,
                traceback,
            }),
            KernelMessage::KernelInfo { .. }
            | KernelMessage::Idle { .. }
            | KernelMessage::ShuttingDown => None,
        }
    }
}

/// Write one message as a JSON line and flush.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), KernelError> {
    let mut line = serde_json::to_vec(message).map_err(|e| {
        KernelError::Communication(format!("Failed to encode kernel message: {}", e))
    })?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .map_err(|e| KernelError::Communication(format!("Failed to write kernel message: {}", e)))?;
    writer
        .flush()
        .map_err(|e| KernelError::Communication(format!("Failed to flush kernel stream: {}", e)))?;
    Ok(())
}

/// Read one JSON-line message.
///
/// Returns `Ok(None)` at end of stream. Blank lines are skipped.
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, KernelError> {
    loop {
        let mut line = String::new();
        let read = reader
            .by_ref()
            .take(MAX_MESSAGE_LEN + 1)
            .read_line(&mut line)
            .map_err(|e| KernelError::Communication(format!("Failed to read kernel message: {}", e)))?;

        if read == 0 {
            return Ok(None);
        }
        if read as u64 > MAX_MESSAGE_LEN {
            return Err(KernelError::Communication(format!(
                "Kernel message too large: more than {} bytes",
                MAX_MESSAGE_LEN
            )));
        }
        if line.trim().is_empty() {
            continue;
        }

        return serde_json::from_str(&line).map(Some).map_err(|e| {
            KernelError::Communication(format!(
                "Failed to decode kernel message '{}': {}",
                line.trim_end(),
                e
            ))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_command_wire_format() {
        let mut buf = Vec::new();
        write_message(
            &mut buf,
            &KernelCommand::Execute {
                source: "print(1)".to_string(),
                silent: false,
            },
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "{\"type\":\"execute\",\"source\":\"print(1)\",\"silent\":false}\n"
        );
    }

    #[test]
    fn test_reads_reply_sequence() {
        let wire = concat!(
            "{\"type\":\"stream\",\"name\":\"stdout\",\"text\":\"1\\n\"}\n",
            "\n",
            "{\"type\":\"idle\",\"status\":\"ok\",\"execution_count\":1}\n",
        );
        let mut cursor = Cursor::new(wire.as_bytes());

        let first: KernelMessage = read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(first.into_output(), Some(Output::stdout("1\n")));

        let second: KernelMessage = read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(
            second,
            KernelMessage::Idle {
                status: ReplyStatus::Ok,
                execution_count: Some(1)
            }
        );

        let eof: Option<KernelMessage> = read_message(&mut cursor).unwrap();
        assert!(eof.is_none());
    }

    #[test]
    fn test_malformed_line_is_communication_error() {
        let mut cursor = Cursor::new(b"not json\n".as_slice());
        let result: Result<Option<KernelMessage>, _> = read_message(&mut cursor);
        assert!(matches!(result, Err(KernelError::Communication(_))));
    }

    #[test]
    fn test_error_message_becomes_error_output() {
        let msg = KernelMessage::Error {
            ename: "ValueError".to_string(),
            evalue: "x".to_string(),
            traceback: vec!["line 1".to_string()],
        };
        let output = msg.into_output().unwrap();
        assert!(output.is_error());
    }
}
