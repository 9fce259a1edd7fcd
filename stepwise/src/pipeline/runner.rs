//! Runs step-groups and interprets control-flow signals.

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::control::{ControlFlow, GroupInstruction};
use super::definition::{PipelineDefinition, StepGroup};
use super::step::GroupCaller;
use crate::context::{Context, RunErrorRecord};
use crate::errors::StepwiseError;
use crate::invoker::{PipelineCallFrame, PipelineInvoker};

/// Executes the step-groups of one loaded pipeline.
pub(crate) struct StepsRunner<'a> {
    definition: &'a PipelineDefinition,
    invoker: &'a PipelineInvoker,
    frame: &'a PipelineCallFrame,
}

impl<'a> StepsRunner<'a> {
    pub(crate) fn new(
        definition: &'a PipelineDefinition,
        invoker: &'a PipelineInvoker,
        frame: &'a PipelineCallFrame,
    ) -> Self {
        Self {
            definition,
            invoker,
            frame,
        }
    }

    /// Runs `groups` in order, then `success`. On failure, records the
    /// error, runs `failure` and re-raises.
    ///
    /// A `stopstepgroup` inside the failure group suppresses the re-raise.
    pub(crate) fn run_step_groups<'b>(
        &'b self,
        ctx: &'b mut Context,
        groups: &'b [String],
        success: Option<&'b str>,
        failure: Option<&'b str>,
    ) -> BoxFuture<'b, Result<(), StepwiseError>> {
        Box::pin(async move {
            if groups.is_empty() {
                return Err(StepwiseError::definition(
                    "you must specify which step-groups you want to run",
                ));
            }

            let outcome = async {
                for group in groups {
                    self.run_step_group(ctx, group, false).await?;
                }
                match success {
                    Some(success) => {
                        tracing::debug!(group = %success, "step-groups complete, running success group");
                        self.run_step_group(ctx, success, false).await
                    }
                    None => {
                        tracing::debug!("step-groups complete, no success group specified");
                        Ok(())
                    }
                }
            }
            .await;

            let err = match outcome {
                Ok(()) => return Ok(()),
                Err(err) if err.is_control_flow() => return Err(err),
                Err(err) => self.ensure_recorded(ctx, err),
            };

            let Some(failure) = failure else {
                tracing::debug!("something went wrong, no failure group specified");
                return Err(err);
            };
            tracing::error!(group = %failure, error = %err, "Something went wrong. Will now try to run the failure group.");
            match self.run_failure_step_group(ctx, failure).await {
                Ok(()) => {
                    tracing::debug!("Raising original error to caller.");
                    Err(err)
                }
                Err(StepwiseError::Control(ControlFlow::StopStepGroup)) => {
                    tracing::debug!(group = %failure, "failure group stopped, not raising original error");
                    Ok(())
                }
                Err(signal) => Err(signal),
            }
        })
    }

    /// Runs a failure handler, swallowing anything but stop signals so the
    /// original error is not obscured. Its own failures are still recorded.
    pub(crate) async fn run_failure_step_group(
        &self,
        ctx: &mut Context,
        group: &str,
    ) -> Result<(), StepwiseError> {
        match self.run_step_group(ctx, group, true).await {
            Ok(()) => Ok(()),
            Err(signal) if signal.is_control_flow() => {
                tracing::debug!(group = %group, signal = %signal, "stop instruction in failure handler");
                Err(signal)
            }
            Err(err) => {
                let err = self.ensure_recorded(ctx, err);
                tracing::error!(group = %group, error = %err, "Failure handler also failed. Swallowing.");
                Ok(())
            }
        }
    }

    fn run_step_group<'b>(
        &'b self,
        ctx: &'b mut Context,
        name: &'b str,
        raise_stop: bool,
    ) -> BoxFuture<'b, Result<(), StepwiseError>> {
        Box::pin(async move {
            let Some(group) = self.definition.group(name) else {
                if self.invoker.config().is_default_group(name) {
                    tracing::debug!(group = %name, pipeline = %self.frame.name, "pipeline has no such step-group, skipping");
                    return Ok(());
                }
                return Err(StepwiseError::definition(format!(
                    "step-group '{name}' not found in pipeline '{}'",
                    self.frame.name
                )));
            };

            tracing::debug!(group = %name, steps = group.len(), "starting step-group");
            self.invoker.emit(
                "step_group.started",
                serde_json::json!({"pipeline": self.frame.name, "group": name, "steps": group.len()}),
            )
            .await;

            match self.run_steps(ctx, group).await {
                Ok(()) => Ok(()),
                Err(StepwiseError::Control(ControlFlow::Jump(jump))) => {
                    tracing::debug!(groups = ?jump.groups, "jump: jumping");
                    self.run_step_groups(
                        ctx,
                        &jump.groups,
                        jump.success_group.as_deref(),
                        jump.failure_group.as_deref(),
                    )
                    .await
                }
                Err(StepwiseError::Control(ControlFlow::StopStepGroup)) => {
                    tracing::debug!(group = %name, "StopStepGroup: stopped step-group");
                    if raise_stop {
                        Err(ControlFlow::StopStepGroup.into())
                    } else {
                        Ok(())
                    }
                }
                Err(err) => Err(err),
            }
        })
    }

    async fn run_steps(&self, ctx: &mut Context, group: &StepGroup) -> Result<(), StepwiseError> {
        for step in group.steps() {
            let collaborator = self
                .invoker
                .registry()
                .resolve(&step.name, self.frame.location.as_deref())?;
            let index = step.location().index;
            self.invoker.emit(
                "step.started",
                serde_json::json!({"step": step.name, "group": group.name(), "index": index}),
            )
            .await;

            let outcome = step
                .run_with_calls(ctx, collaborator.as_ref(), self.invoker, Some(self))
                .await;
            match outcome {
                Ok(()) => {
                    self.invoker
                        .emit(
                            "step.completed",
                            serde_json::json!({"step": step.name, "group": group.name(), "index": index}),
                        )
                        .await;
                }
                Err(err) => {
                    if !err.is_control_flow() {
                        self.invoker.emit(
                            "step.failed",
                            serde_json::json!({
                                "step": step.name,
                                "group": group.name(),
                                "index": index,
                                "error": err.to_dict(),
                            }),
                        )
                        .await;
                    }
                    return Err(err);
                }
            }
        }
        tracing::debug!(group = %group.name(), count = group.len(), "executed steps");
        Ok(())
    }

    /// Appends `err` to `runErrors` unless a step already did.
    pub(crate) fn ensure_recorded(&self, ctx: &mut Context, err: StepwiseError) -> StepwiseError {
        if err.is_handled() || err.is_control_flow() {
            return err;
        }
        let record = RunErrorRecord::from_error(&err);
        ctx.record_error(record);
        err.into_handled()
    }
}

#[async_trait]
impl<'a> GroupCaller for StepsRunner<'a> {
    async fn call_groups(
        &self,
        ctx: &mut Context,
        instruction: &GroupInstruction,
    ) -> Result<(), StepwiseError> {
        self.run_step_groups(
            ctx,
            &instruction.groups,
            instruction.success_group.as_deref(),
            instruction.failure_group.as_deref(),
        )
        .await
    }
}
