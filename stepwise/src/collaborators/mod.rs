//! Collaborators: the units of work a step invokes.
//!
//! A step names its collaborator by string. The [`CollaboratorRegistry`]
//! maps those names to statically typed [`Collaborator`] implementations;
//! an unknown name is a typed `CollaboratorNotFound` error.

pub mod builtin;
mod registry;

pub use registry::CollaboratorRegistry;

use async_trait::async_trait;
use std::fmt::Debug;

use crate::context::Context;
use crate::errors::StepwiseError;
use crate::invoker::PipelineInvoker;

/// Trait for step collaborators.
///
/// A collaborator receives the current context, may read and mutate it, and
/// signals failure by returning a classified [`StepwiseError`].
#[async_trait]
pub trait Collaborator: Send + Sync + Debug {
    /// Returns the name the collaborator is registered under.
    fn name(&self) -> &str;

    /// Runs the collaborator against the context.
    ///
    /// The invoker is available to collaborators that run child pipelines.
    async fn run(&self, ctx: &mut Context, invoker: &PipelineInvoker) -> Result<(), StepwiseError>;
}

/// A simple function-based collaborator.
pub struct FnCollaborator<F>
where
    F: Fn(&mut Context) -> Result<(), StepwiseError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnCollaborator<F>
where
    F: Fn(&mut Context) -> Result<(), StepwiseError> + Send + Sync,
{
    /// Creates a new function-based collaborator.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnCollaborator<F>
where
    F: Fn(&mut Context) -> Result<(), StepwiseError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCollaborator")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F> Collaborator for FnCollaborator<F>
where
    F: Fn(&mut Context) -> Result<(), StepwiseError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        (self.func)(ctx)
    }
}
