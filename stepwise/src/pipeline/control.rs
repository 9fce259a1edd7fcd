//! Control-flow signals raised by steps and interpreted by the runner.

use std::fmt;

use crate::context::Value;
use crate::errors::{ContextError, StepwiseError};

/// A structural control-flow signal.
///
/// Signals unwind through [`StepwiseError::Control`] but are never treated as
/// failures: `swallow` and `retry` let them pass, and they are not recorded
/// in `runErrors`.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFlow {
    /// Abort every pipeline on the call-stack.
    Stop,
    /// Abort the current pipeline without running handler groups.
    StopPipeline,
    /// Abort the remainder of the current step-group only.
    StopStepGroup,
    /// Run the named groups, then resume after the calling step.
    Call(GroupInstruction),
    /// Run the named groups and abandon the current group.
    Jump(GroupInstruction),
}

impl ControlFlow {
    /// The classification name of the signal.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Stop => "Stop",
            Self::StopPipeline => "StopPipeline",
            Self::StopStepGroup => "StopStepGroup",
            Self::Call(_) => "Call",
            Self::Jump(_) => "Jump",
        }
    }
}

impl fmt::Display for ControlFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::StopPipeline => write!(f, "stop pipeline"),
            Self::StopStepGroup => write!(f, "stop step-group"),
            Self::Call(instruction) => write!(f, "call {instruction}"),
            Self::Jump(instruction) => write!(f, "jump {instruction}"),
        }
    }
}

/// Which groups a `call` or `jump` runs, and their handlers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupInstruction {
    /// Groups to run, in order. Never empty.
    pub groups: Vec<String>,
    /// Group to run once all `groups` succeed.
    pub success_group: Option<String>,
    /// Group to run if any of `groups` fails.
    pub failure_group: Option<String>,
    /// Context entry written back once a `call` returns.
    pub restore: Option<(String, Value)>,
}

impl GroupInstruction {
    /// Creates an instruction with no handler groups.
    #[must_use]
    pub fn new(groups: Vec<String>) -> Self {
        Self {
            groups,
            success_group: None,
            failure_group: None,
            restore: None,
        }
    }

    /// Sets the success handler.
    #[must_use]
    pub fn with_success(mut self, group: impl Into<String>) -> Self {
        self.success_group = Some(group.into());
        self
    }

    /// Sets the failure handler.
    #[must_use]
    pub fn with_failure(mut self, group: impl Into<String>) -> Self {
        self.failure_group = Some(group.into());
        self
    }

    /// Puts `key` back to its raw `value` after the called groups finish.
    #[must_use]
    pub fn with_restore(mut self, key: impl Into<String>, value: Value) -> Self {
        self.restore = Some((key.into(), value));
        self
    }

    /// Parses an already formatted `call`/`jump` value.
    ///
    /// Accepts a group name, a list of group names, or a mapping with
    /// `groups` (required) and optional `success`/`failure`.
    pub fn from_value(value: &Value, key: &str) -> Result<Self, StepwiseError> {
        match value {
            Value::String(group) => Ok(Self::new(vec![group.clone()])),
            Value::List(_) => Ok(Self::new(group_names(value, key)?)),
            Value::Map(map) => {
                let groups = map.get("groups").ok_or_else(|| ContextError::KeyNotFound {
                    key: format!("{key}.groups"),
                    caller: key.to_string(),
                })?;
                let groups = match groups {
                    Value::String(group) => vec![group.clone()],
                    other => group_names(other, key)?,
                };
                if groups.is_empty() {
                    return Err(ContextError::NoValue {
                        key: format!("{key}.groups"),
                        caller: key.to_string(),
                    }
                    .into());
                }
                let mut instruction = Self::new(groups);
                instruction.success_group = optional_group(map.get("success"), key, "success")?;
                instruction.failure_group = optional_group(map.get("failure"), key, "failure")?;
                Ok(instruction)
            }
            other => Err(ContextError::WrongType {
                key: key.to_string(),
                expected: "a group name, list of group names or mapping".to_string(),
                found: other.type_name().to_string(),
                caller: key.to_string(),
            }
            .into()),
        }
    }
}

fn group_names(value: &Value, key: &str) -> Result<Vec<String>, StepwiseError> {
    let Value::List(items) = value else {
        return Err(ContextError::WrongType {
            key: key.to_string(),
            expected: "a list of group names".to_string(),
            found: value.type_name().to_string(),
            caller: key.to_string(),
        }
        .into());
    };
    items
        .iter()
        .map(|item| match item {
            Value::String(name) => Ok(name.clone()),
            other => Err(ContextError::WrongType {
                key: key.to_string(),
                expected: "group names as strings".to_string(),
                found: other.type_name().to_string(),
                caller: key.to_string(),
            }
            .into()),
        })
        .collect()
}

fn optional_group(
    value: Option<&Value>,
    key: &str,
    field: &str,
) -> Result<Option<String>, StepwiseError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(name)) => Ok(Some(name.clone())),
        Some(other) => Err(ContextError::WrongType {
            key: format!("{key}.{field}"),
            expected: "a group name".to_string(),
            found: other.type_name().to_string(),
            caller: key.to_string(),
        }
        .into()),
    }
}

impl fmt::Display for GroupInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.groups.join(", "))?;
        if let Some(success) = &self.success_group {
            write!(f, " success={success}")?;
        }
        if let Some(failure) = &self.failure_group {
            write!(f, " failure={failure}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_single_group() {
        let parsed = GroupInstruction::from_value(&Value::from("g1"), "call").unwrap();
        assert_eq!(parsed, GroupInstruction::new(vec!["g1".to_string()]));
    }

    #[test]
    fn test_parse_list() {
        let parsed =
            GroupInstruction::from_value(&Value::from(json!(["a", "b"])), "jump").unwrap();
        assert_eq!(parsed.groups, vec!["a", "b"]);
        assert!(parsed.success_group.is_none());
    }

    #[test]
    fn test_parse_mapping() {
        let value = Value::from(json!({"groups": "a", "success": "s", "failure": "f"}));
        let parsed = GroupInstruction::from_value(&value, "call").unwrap();
        assert_eq!(
            parsed,
            GroupInstruction::new(vec!["a".to_string()])
                .with_success("s")
                .with_failure("f")
        );
    }

    #[test]
    fn test_mapping_requires_groups() {
        let value = Value::from(json!({"success": "s"}));
        let err = GroupInstruction::from_value(&value, "call").unwrap_err();
        assert_eq!(err.kind_name(), "KeyNotInContextError");

        let value = Value::from(json!({"groups": []}));
        let err = GroupInstruction::from_value(&value, "call").unwrap_err();
        assert_eq!(err.kind_name(), "KeyInContextHasNoValueError");
    }

    #[test]
    fn test_handler_must_be_string() {
        let value = Value::from(json!({"groups": ["a"], "success": ["s"]}));
        assert!(GroupInstruction::from_value(&value, "call").is_err());
    }

    #[test]
    fn test_display() {
        let signal = ControlFlow::Call(GroupInstruction::new(vec!["a".to_string()]).with_success("s"));
        assert_eq!(signal.to_string(), "call [a] success=s");
        assert_eq!(ControlFlow::StopStepGroup.kind_name(), "StopStepGroup");
    }
}
