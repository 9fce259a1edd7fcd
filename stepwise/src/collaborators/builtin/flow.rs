//! Control-flow collaborators: `call`, `jump`, `switch` and the three stops.

use async_trait::async_trait;

use crate::collaborators::Collaborator;
use crate::context::{Context, Value};
use crate::errors::{ContextError, StepwiseError};
use crate::invoker::PipelineInvoker;
use crate::pipeline::{ControlFlow, GroupInstruction};

fn instruction(ctx: &mut Context, key: &str) -> Result<GroupInstruction, StepwiseError> {
    ctx.assert_key_has_value(key, key)?;
    let config = ctx.get_formatted(key)?;
    GroupInstruction::from_value(&config, key)
}

/// Runs step-groups, then resumes after the calling step.
///
/// Reads context key `call`: a group name, a list of names, or
/// `{groups, success, failure}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallStep;

#[async_trait]
impl Collaborator for CallStep {
    fn name(&self) -> &str {
        "call"
    }

    async fn run(&self, ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        let raw = ctx.assert_key_has_value("call", "call")?.clone();
        let instruction = instruction(ctx, "call")?.with_restore("call", raw);
        tracing::debug!(groups = ?instruction.groups, "call");
        Err(ControlFlow::Call(instruction).into())
    }
}

/// Runs step-groups and abandons the rest of the current group.
///
/// Reads context key `jump`, in the same shapes as `call`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JumpStep;

#[async_trait]
impl Collaborator for JumpStep {
    fn name(&self) -> &str {
        "jump"
    }

    async fn run(&self, ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        let instruction = instruction(ctx, "jump")?;
        tracing::debug!(groups = ?instruction.groups, "jump");
        Err(ControlFlow::Jump(instruction).into())
    }
}

/// Calls the groups of the first `switch` case that evaluates true.
///
/// Reads context key `switch`, a list of `{case, call}` entries. The last
/// entry may instead be `{default: <call>}`, used when no case matched.
/// `call` takes the same shapes as the `call` step. Without a match and
/// without a default the step does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchStep;

#[async_trait]
impl Collaborator for SwitchStep {
    fn name(&self) -> &str {
        "switch"
    }

    async fn run(&self, ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        let raw = ctx.assert_key_has_value("switch", "switch")?.clone();
        let Value::List(cases) = &raw else {
            return Err(ContextError::WrongType {
                key: "switch".to_string(),
                expected: "a list of cases".to_string(),
                found: raw.type_name().to_string(),
                caller: "switch".to_string(),
            }
            .into());
        };

        let last = cases.len().saturating_sub(1);
        for (index, case) in cases.iter().enumerate() {
            let Value::Map(case) = case else {
                return Err(ContextError::WrongType {
                    key: format!("switch[{index}]"),
                    expected: "a mapping".to_string(),
                    found: case.type_name().to_string(),
                    caller: "switch".to_string(),
                }
                .into());
            };

            let target = match case.get("default").filter(|_| index == last) {
                Some(default) => {
                    tracing::debug!("no switch case true, running default");
                    default
                }
                None => {
                    let expression = case.get("case").ok_or_else(|| ContextError::KeyNotFound {
                        key: format!("switch[{index}].case"),
                        caller: "switch".to_string(),
                    })?;
                    let call = case.get("call").ok_or_else(|| ContextError::KeyNotFound {
                        key: format!("switch[{index}].call"),
                        caller: "switch".to_string(),
                    })?;
                    if !call.is_truthy() {
                        return Err(ContextError::NoValue {
                            key: format!("switch[{index}].call"),
                            caller: "switch".to_string(),
                        }
                        .into());
                    }
                    if !ctx.get_formatted_bool(expression)? {
                        continue;
                    }
                    tracing::debug!(case = %expression, "switch case is true");
                    call
                }
            };

            let config = ctx.get_formatted_value(target)?;
            let instruction =
                GroupInstruction::from_value(&config, "switch")?.with_restore("switch", raw.clone());
            tracing::info!(groups = ?instruction.groups, "switch: calling step-groups");
            return Err(ControlFlow::Call(instruction).into());
        }

        tracing::info!("no matching case found in switch");
        Ok(())
    }
}

/// Stops every pipeline on the call-stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopStep;

#[async_trait]
impl Collaborator for StopStep {
    fn name(&self) -> &str {
        "stop"
    }

    async fn run(&self, _ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        Err(ControlFlow::Stop.into())
    }
}

/// Stops the current pipeline without running handler groups.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopPipelineStep;

#[async_trait]
impl Collaborator for StopPipelineStep {
    fn name(&self) -> &str {
        "stoppipeline"
    }

    async fn run(&self, _ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        Err(ControlFlow::StopPipeline.into())
    }
}

/// Stops the current step-group.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopStepGroupStep;

#[async_trait]
impl Collaborator for StopStepGroupStep {
    fn name(&self) -> &str {
        "stopstepgroup"
    }

    async fn run(&self, _ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        Err(ControlFlow::StopStepGroup.into())
    }
}
