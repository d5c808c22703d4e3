//! In-memory notebook document.
//!
//! The parsing front-end hands the engine a [`Notebook`]; execution mutates
//! its code cells in place and the renderer consumes the result.

mod model;
mod streams;

pub use model::{
    CELLAR_METADATA_KEY, Cell, CellMetadata, CodeCell, EXECUTION_METADATA_KEY, KernelSpecInfo,
    MimeBundle, Notebook, NotebookMetadata, Output, StreamName, TAG_RAISES_EXCEPTION,
    TAG_SKIP_EXECUTION, TextCell,
};
pub use streams::coalesce_streams;
