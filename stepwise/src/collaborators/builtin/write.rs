//! The context write collaborators: `set`, `default` and `contextmerge`.

use async_trait::async_trait;

use super::mapping_input;
use crate::collaborators::Collaborator;
use crate::context::Context;
use crate::errors::StepwiseError;
use crate::invoker::PipelineInvoker;

/// Overwrites context keys with the formatted entries of `set`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetStep;

#[async_trait]
impl Collaborator for SetStep {
    fn name(&self) -> &str {
        "set"
    }

    async fn run(&self, ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        let values = mapping_input(ctx, "set", "set")?.clone();
        ctx.set_values(&values)?;
        tracing::debug!(count = values.len(), "set context keys");
        Ok(())
    }
}

/// Writes the entries of `defaults` only where keys are missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStep;

#[async_trait]
impl Collaborator for DefaultStep {
    fn name(&self) -> &str {
        "default"
    }

    async fn run(&self, ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        let defaults = mapping_input(ctx, "defaults", "default")?.clone();
        ctx.set_defaults(&defaults)?;
        Ok(())
    }
}

/// Deep-merges `contextMerge` into the context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextMergeStep;

#[async_trait]
impl Collaborator for ContextMergeStep {
    fn name(&self) -> &str {
        "contextmerge"
    }

    async fn run(&self, ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        let add_me = mapping_input(ctx, "contextMerge", "contextmerge")?.clone();
        ctx.merge(&add_me)?;
        Ok(())
    }
}
