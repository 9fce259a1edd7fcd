//! # Stepwise
//!
//! A declarative pipeline engine. Pipelines are YAML documents of named
//! step-groups; each step runs a registered collaborator against a shared,
//! mutable context.
//!
//! Stepwise provides:
//!
//! - **Context formatting**: `{key}` interpolation, `!sic` literals and
//!   `!expr` inline expressions resolved on every step
//! - **Step decorators**: `while`, `foreach`, `run`, `skip`, `retry`,
//!   `swallow` and `onError`, applied in a fixed order
//! - **Control flow**: `call`, `jump` and three scopes of stop
//! - **Child pipelines**: `pype` runs another pipeline on a shared or
//!   isolated context, with relative lookup from the invoking pipeline
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stepwise::prelude::*;
//!
//! let invoker = PipelineInvoker::new();
//! invoker.registry().register_fn("greet", |ctx| {
//!     let name = ctx.get_formatted_string("{name}")?;
//!     ctx.insert("greeting", format!("hello {name}"));
//!     Ok(())
//! });
//!
//! let ctx = invoker
//!     .run(&PipelineRequest::new("hello"), Some(Context::from_json(json!({"name": "you"}))))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod collaborators;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod expressions;
pub mod invoker;
pub mod pipeline;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::collaborators::{Collaborator, CollaboratorRegistry, FnCollaborator};
    pub use crate::config::EngineConfig;
    pub use crate::context::{Context, Map, RunErrorRecord, Value};
    pub use crate::errors::{ContextError, ErrorKind, FormattingError, StepwiseError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::expressions::{ExpressionEvaluator, RhaiEvaluator};
    pub use crate::invoker::{
        ContextParser, FileLoader, InMemoryLoader, Loader, PipelineCallFrame, PipelineInvoker,
        PipelineRequest,
    };
    pub use crate::pipeline::{ControlFlow, PipelineDefinition, Step, StepGroup};
}
