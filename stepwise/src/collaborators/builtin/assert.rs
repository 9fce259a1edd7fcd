//! The `assert` collaborator.

use async_trait::async_trait;

use super::mapping_input;
use crate::collaborators::Collaborator;
use crate::context::Context;
use crate::errors::{ContextError, StepwiseError};
use crate::invoker::PipelineInvoker;

/// Fails the step unless `assert.this` is truthy, or equals `assert.equals`
/// when that is given. Both sides are formatted first.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssertStep;

#[async_trait]
impl Collaborator for AssertStep {
    fn name(&self) -> &str {
        "assert"
    }

    async fn run(&self, ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        let config = mapping_input(ctx, "assert", "assert")?.clone();
        let this = config.get("this").ok_or_else(|| ContextError::KeyNotFound {
            key: "assert.this".to_string(),
            caller: "assert".to_string(),
        })?;

        match config.get("equals") {
            Some(equals) => {
                let left = ctx.get_formatted_value(this)?;
                let right = ctx.get_formatted_value(equals)?;
                let result = left == right;
                tracing::info!(result, "assert evaluated");
                if !result {
                    return Err(StepwiseError::Assertion(format!(
                        "assert['this'] is of type {} and does not equal assert['equals'] of type {}.",
                        left.type_name(),
                        right.type_name()
                    )));
                }
            }
            None => {
                let result = ctx.get_formatted_bool(this)?;
                tracing::info!(result, "assert evaluated");
                if !result {
                    return Err(StepwiseError::Assertion(format!("{this} evaluated to False.")));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn run(input: serde_json::Value) -> Result<(), StepwiseError> {
        let invoker = PipelineInvoker::new();
        let mut ctx = Context::from_json(input);
        AssertStep.run(&mut ctx, &invoker).await
    }

    #[tokio::test]
    async fn test_truthy() {
        assert!(run(json!({"ok": true, "assert": {"this": "{ok}"}})).await.is_ok());
        let err = run(json!({"assert": {"this": "false"}})).await.unwrap_err();
        assert_eq!(err.kind_name(), "AssertionError");
    }

    #[tokio::test]
    async fn test_equals_compares_typed_values() {
        assert!(run(json!({"n": 3, "assert": {"this": "{n}", "equals": 3}}))
            .await
            .is_ok());
        let err = run(json!({"n": 3, "assert": {"this": "{n}", "equals": "3"}}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not equal"));
    }

    #[tokio::test]
    async fn test_missing_this() {
        let err = run(json!({"assert": {"equals": 1}})).await.unwrap_err();
        assert_eq!(err.kind_name(), "KeyNotInContextError");
    }
}
