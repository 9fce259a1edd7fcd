//! The `exec` collaborator: inline statement blocks.

use async_trait::async_trait;

use crate::collaborators::Collaborator;
use crate::context::{Context, Value};
use crate::errors::{ContextError, StepwiseError};
use crate::invoker::PipelineInvoker;

/// Runs context key `exec` as a statement block.
///
/// `exec` is either the code itself, or `{code, export}` where `export`
/// names the new bindings to keep. Mutating existing context values always
/// persists; other new bindings are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecStep;

#[async_trait]
impl Collaborator for ExecStep {
    fn name(&self) -> &str {
        "exec"
    }

    async fn run(&self, ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        let config = ctx.assert_key_has_value("exec", "exec")?.clone();
        let (code, exports) = match &config {
            Value::String(code) | Value::Literal(code) => (code.clone(), Vec::new()),
            Value::Map(map) => {
                let code = match map.get("code") {
                    Some(Value::String(code) | Value::Literal(code)) => code.clone(),
                    Some(other) => {
                        return Err(ContextError::WrongType {
                            key: "exec.code".to_string(),
                            expected: "a string".to_string(),
                            found: other.type_name().to_string(),
                            caller: "exec".to_string(),
                        }
                        .into())
                    }
                    None => {
                        return Err(ContextError::KeyNotFound {
                            key: "exec.code".to_string(),
                            caller: "exec".to_string(),
                        }
                        .into())
                    }
                };
                let exports = match map.get("export") {
                    Some(export) => ctx
                        .get_formatted_list(export, "exec.export")?
                        .into_iter()
                        .map(|name| name.to_string())
                        .collect(),
                    None => Vec::new(),
                };
                (code, exports)
            }
            other => {
                return Err(ContextError::WrongType {
                    key: "exec".to_string(),
                    expected: "code or a mapping with code".to_string(),
                    found: other.type_name().to_string(),
                    caller: "exec".to_string(),
                }
                .into())
            }
        };

        tracing::debug!(exports = ?exports, "Executing inline code");
        ctx.execute_statements(&code, &exports)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mutation_persists_scratch_does_not() {
        let invoker = PipelineInvoker::new();
        let mut ctx = Context::from_json(json!({
            "items": [1],
            "exec": "let scratch = 5; items.push(scratch);"
        }));
        ExecStep.run(&mut ctx, &invoker).await.unwrap();
        assert_eq!(ctx.get("items").map(Value::to_json), Some(json!([1, 5])));
        assert!(!ctx.contains_key("scratch"));
    }

    #[tokio::test]
    async fn test_export_keeps_named_bindings() {
        let invoker = PipelineInvoker::new();
        let mut ctx = Context::from_json(json!({
            "exec": {"code": "let total = 2 + 3; let tmp = 1;", "export": ["total"]}
        }));
        ExecStep.run(&mut ctx, &invoker).await.unwrap();
        assert_eq!(ctx.get("total"), Some(&Value::Int(5)));
        assert!(!ctx.contains_key("tmp"));
    }

    #[tokio::test]
    async fn test_script_error_is_expression_error() {
        let invoker = PipelineInvoker::new();
        let mut ctx = Context::from_json(json!({"exec": "let x = ;"}));
        let err = ExecStep.run(&mut ctx, &invoker).await.unwrap_err();
        assert_eq!(err.kind_name(), "ExpressionError");
    }
}
