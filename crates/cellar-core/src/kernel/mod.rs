//! Kernel clients.
//!
//! A [`KernelProvider`] starts sessions for a kernel name; a
//! [`KernelSession`] runs cell sources one at a time and blocks until each
//! finishes, fails, or times out. Sessions are always held through a
//! [`KernelGuard`], which shuts the kernel down on every exit path.
//!
//! ```text
//! KernelProvider::start(kernel name, cwd)
//!     │
//!     └── KernelGuard (scoped ownership)
//!             │
//!             ├── execute_cell(source, timeout) → Vec<Output>
//!             ├── evaluate(name, timeout)       → Vec<Output>
//!             │
//!             └── Drop → shutdown()
//! ```

mod process;
mod protocol;
mod spec;

pub use process::{ProcessKernel, ProcessKernelProvider};
pub use protocol::{KernelCommand, KernelMessage, ReplyStatus, read_message, write_message};
pub use spec::{
    InstalledKernel, KERNEL_PATH_ENV, KERNEL_SPEC_FILE, KernelAliases, KernelRegistry,
    KernelSpecFile,
};

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::time::Duration;

use serde_json::Value;

use crate::error::KernelError;
use crate::notebook::Output;

/// Parameters for starting a kernel.
#[derive(Debug, Clone, Copy)]
pub struct KernelLaunch<'a> {
    /// Resolved kernel name (after aliasing).
    pub kernel_name: &'a str,
    /// Working directory for the kernel.
    pub cwd: &'a Path,
}

/// Starts kernel sessions.
pub trait KernelProvider: Send + Sync {
    /// Start a kernel matching `launch.kernel_name`.
    ///
    /// Fails with [`KernelError::Start`] when no such kernel is installed.
    fn start(&self, launch: &KernelLaunch<'_>) -> Result<Box<dyn KernelSession>, KernelError>;
}

/// A running kernel.
///
/// Calls block the current thread. Cells must be submitted one at a time;
/// later cells see the state left by earlier ones.
pub trait KernelSession: Send {
    /// Language info reported by the kernel at startup.
    fn language_info(&self) -> Option<&Value> {
        None
    }

    /// Run one cell and return its outputs in arrival order.
    ///
    /// Kernel exceptions are [`KernelError::CellExecution`], an exceeded
    /// `timeout` is [`KernelError::CellTimeout`]; both carry the outputs
    /// emitted so far. A broken transport is [`KernelError::Communication`].
    fn execute_cell(&mut self, source: &str, timeout: Option<Duration>) -> Result<Vec<Output>, KernelError>;

    /// Evaluate an expression without recording it in the kernel history.
    fn evaluate(&mut self, expression: &str, timeout: Option<Duration>) -> Result<Vec<Output>, KernelError> {
        self.execute_cell(expression, timeout)
    }

    /// Stop the kernel and release its resources. Must be idempotent.
    fn shutdown(&mut self) -> Result<(), KernelError>;
}

/// Scoped ownership of a kernel session.
///
/// The kernel is shut down when the guard is dropped, whether execution
/// completed, timed out, or bailed out with an error.
pub struct KernelGuard {
    session: Box<dyn KernelSession>,
    kernel_name: String,
    closed: bool,
}

impl KernelGuard {
    /// Start a kernel through `provider`.
    pub fn start(provider: &dyn KernelProvider, launch: &KernelLaunch<'_>) -> Result<Self, KernelError> {
        let session = provider.start(launch)?;
        tracing::debug!("Kernel '{}' started in {}", launch.kernel_name, launch.cwd.display());
        Ok(Self {
            session,
            kernel_name: launch.kernel_name.to_string(),
            closed: false,
        })
    }

    /// Name of the running kernel.
    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    /// Shut the kernel down now, reporting any failure.
    pub fn close(mut self) -> Result<(), KernelError> {
        self.closed = true;
        self.session.shutdown()
    }
}

impl Deref for KernelGuard {
    type Target = dyn KernelSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for KernelGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl Drop for KernelGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.session.shutdown() {
            tracing::warn!("Failed to shut down kernel '{}': {}", self.kernel_name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSession {
        shutdowns: Arc<AtomicUsize>,
    }

    impl KernelSession for CountingSession {
        fn execute_cell(&mut self, source: &str, _: Option<Duration>) -> Result<Vec<Output>, KernelError> {
            if source == "boom" {
                return Err(KernelError::Communication("gone".to_string()));
            }
            Ok(vec![Output::stdout(source)])
        }

        fn shutdown(&mut self) -> Result<(), KernelError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingProvider {
        shutdowns: Arc<AtomicUsize>,
    }

    impl KernelProvider for CountingProvider {
        fn start(&self, launch: &KernelLaunch<'_>) -> Result<Box<dyn KernelSession>, KernelError> {
            if launch.kernel_name != "toy" {
                return Err(KernelError::Start {
                    kernel: launch.kernel_name.to_string(),
                    reason: "not installed".to_string(),
                });
            }
            Ok(Box::new(CountingSession {
                shutdowns: self.shutdowns.clone(),
            }))
        }
    }

    fn launch(name: &str) -> (String, PathBuf) {
        (name.to_string(), PathBuf::from("."))
    }

    #[test]
    fn test_guard_shuts_down_on_error_path() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let provider = CountingProvider {
            shutdowns: shutdowns.clone(),
        };
        let (name, cwd) = launch("toy");

        let run = || -> Result<(), KernelError> {
            let mut guard = KernelGuard::start(
                &provider,
                &KernelLaunch {
                    kernel_name: &name,
                    cwd: &cwd,
                },
            )?;
            guard.execute_cell("ok", None)?;
            guard.execute_cell("boom", None)?;
            Ok(())
        };

        assert!(run().is_err());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_explicit_close_does_not_double_shutdown() {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let provider = CountingProvider {
            shutdowns: shutdowns.clone(),
        };
        let (name, cwd) = launch("toy");

        let guard = KernelGuard::start(
            &provider,
            &KernelLaunch {
                kernel_name: &name,
                cwd: &cwd,
            },
        )
        .unwrap();
        guard.close().unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_kernel() {
        let provider = CountingProvider {
            shutdowns: Arc::new(AtomicUsize::new(0)),
        };
        let (name, cwd) = launch("python3");
        let result = KernelGuard::start(
            &provider,
            &KernelLaunch {
                kernel_name: &name,
                cwd: &cwd,
            },
        );
        assert!(matches!(result, Err(KernelError::Start { .. })));
    }
}
