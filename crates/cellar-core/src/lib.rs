//! Notebook execution and output caching engine.
//!
//! This crate provides:
//! - Notebook document model (nbformat v4)
//! - Fingerprint keys identifying a notebook's executable content
//! - Kernel clients with per-cell timeouts and scoped shutdown
//! - Direct, cached and inline execution strategies
//! - A content-addressed on-disk cache with artifact retention
//! - An orchestrator that picks a strategy per notebook and collects statistics

pub mod cache;
pub mod config;
pub mod error;
pub mod execute;
pub mod fingerprint;
pub mod kernel;
pub mod notebook;
pub mod orchestrator;
pub mod stats;

pub use cache::{CacheEntry, CacheStore, PendingEntry, collect_artifacts};
pub use config::{ExecutionConfig, ExecutionMode, KernelAlias};
pub use error::{CacheError, CellException, Error, ExecutionError, KernelError, Result};
pub use execute::{
    CellPolicy, ExecutionContext, ExecutionMetadata, ExecutionResult, ExecutionState,
    InlineSession, Strategy, WorkDir, execute_cached, execute_direct,
};
pub use fingerprint::{FingerprintKey, FingerprintSettings};
pub use kernel::{
    InstalledKernel, KernelAliases, KernelGuard, KernelLaunch, KernelProvider, KernelRegistry,
    KernelSession, ProcessKernel, ProcessKernelProvider,
};
pub use notebook::{Cell, CodeCell, Notebook, Output, StreamName};
pub use orchestrator::{NotebookClient, Orchestrator};
pub use stats::{ExecutionStats, StatsSummary};
