//! Pipeline loading and invocation.
//!
//! This module provides:
//! - [`PipelineInvoker`], which loads pipelines and runs their step-groups
//! - the [`Loader`] seam with file-system and in-memory implementations
//! - [`ContextParser`]s that seed a context from raw arguments
//! - [`PipelineCallFrame`], the persistent call-stack

mod file_loader;
mod frame;
mod loader;
mod parser;
mod pipeline_invoker;

pub use file_loader::FileLoader;
pub use frame::PipelineCallFrame;
pub use loader::{InMemoryLoader, Loader};
pub use parser::{ContextParser, KeyValuePairsParser};
pub use pipeline_invoker::{PipelineInvoker, PipelineRequest};
