//! Error types for the stepwise engine.
//!
//! Every failure the engine can surface is a [`StepwiseError`]. Errors carry a
//! classification name (see [`StepwiseError::kind_name`]) that `retry.stopOn`
//! and `retry.retryOn` match against, and that ends up in `runErrors`.
//!
//! Control flow (stop, call, jump) travels through the same channel as
//! [`StepwiseError::Control`] so that it unwinds with `?`, but it is never
//! swallowed, retried or recorded as a failure.

use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::pipeline::control::ControlFlow;

/// The main error type for stepwise operations.
#[derive(Debug, Error)]
pub enum StepwiseError {
    /// A string-interpolation expression could not be resolved.
    #[error("{0}")]
    Formatting(#[from] FormattingError),

    /// A collaborator found its context inputs missing or malformed.
    #[error("{0}")]
    Context(#[from] ContextError),

    /// A dynamic expression or code block failed.
    #[error("{0}")]
    Expression(#[from] ExpressionError),

    /// An explicit pipeline assertion failed.
    #[error("assert failed: {0}")]
    Assertion(String),

    /// No collaborator is registered under the referenced name.
    #[error("collaborator '{name}' is not registered")]
    CollaboratorNotFound {
        /// The unresolved reference.
        name: String,
    },

    /// No loader could find the pipeline.
    #[error("{}", pipeline_not_found_message(.name, .searched))]
    PipelineNotFound {
        /// The requested pipeline name.
        name: String,
        /// Every location the loader tried, in order.
        searched: Vec<String>,
    },

    /// The pipeline or step definition is malformed.
    #[error("pipeline definition error: {0}")]
    PipelineDefinition(String),

    /// A `while` loop ran out of iterations with `errorOnMax` set.
    #[error("{0}")]
    LoopMaxExhausted(String),

    /// A collaborator failed with a classified error.
    #[error("{kind}: {message}")]
    StepExecution {
        /// Classification name, matched by `retry.stopOn`/`retry.retryOn`.
        kind: String,
        /// Human readable description.
        message: String,
    },

    /// A control-flow signal. Not a failure.
    #[error("{0}")]
    Control(ControlFlow),

    /// An error that has already been appended to `runErrors`.
    #[error("{0}")]
    Handled(Box<StepwiseError>),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Pipeline source could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Catch-all for collaborators built on `anyhow`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn pipeline_not_found_message(name: &str, searched: &[String]) -> String {
    if searched.is_empty() {
        format!("pipeline '{name}' not found")
    } else {
        format!(
            "pipeline '{name}' not found. Looked in: {}",
            searched.join(", ")
        )
    }
}

/// The error taxonomy every [`StepwiseError`] maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Unresolved key, bad expression, non-subscriptable access.
    Formatting,
    /// An explicit pipeline-level assertion.
    Assertion,
    /// Unresolvable step or module reference.
    CollaboratorNotFound,
    /// Unresolvable pipeline reference.
    PipelineNotFound,
    /// Malformed pipeline source or step definition.
    PipelineDefinition,
    /// Anything a collaborator raised.
    StepExecution,
    /// Stop, call and jump signals.
    ControlFlow,
}

impl StepwiseError {
    /// Creates a classified collaborator failure.
    pub fn step_failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepExecution {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Creates a pipeline definition error.
    pub fn definition(message: impl Into<String>) -> Self {
        Self::PipelineDefinition(message.into())
    }

    /// The classification name used by `retry` and recorded in `runErrors`.
    #[must_use]
    pub fn kind_name(&self) -> &str {
        match self {
            Self::Formatting(e) => e.kind_name(),
            Self::Context(e) => e.kind_name(),
            Self::Expression(_) => "ExpressionError",
            Self::Assertion(_) => "AssertionError",
            Self::CollaboratorNotFound { .. } => "CollaboratorNotFoundError",
            Self::PipelineNotFound { .. } => "PipelineNotFoundError",
            Self::PipelineDefinition(_) => "PipelineDefinitionError",
            Self::LoopMaxExhausted(_) => "LoopMaxExhaustedError",
            Self::StepExecution { kind, .. } => kind,
            Self::Control(signal) => signal.kind_name(),
            Self::Handled(inner) => inner.kind_name(),
            Self::Io(_) => "IoError",
            Self::Yaml(_) => "YamlError",
            Self::Other(_) => "Error",
        }
    }

    /// Maps the error onto the engine's error taxonomy.
    #[must_use]
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Formatting(_) | Self::Expression(_) => ErrorKind::Formatting,
            Self::Assertion(_) => ErrorKind::Assertion,
            Self::CollaboratorNotFound { .. } => ErrorKind::CollaboratorNotFound,
            Self::PipelineNotFound { .. } => ErrorKind::PipelineNotFound,
            Self::PipelineDefinition(_) | Self::Yaml(_) => ErrorKind::PipelineDefinition,
            Self::Control(_) => ErrorKind::ControlFlow,
            Self::Handled(inner) => inner.error_kind(),
            Self::Context(_)
            | Self::LoopMaxExhausted(_)
            | Self::StepExecution { .. }
            | Self::Io(_)
            | Self::Other(_) => ErrorKind::StepExecution,
        }
    }

    /// Returns true for stop/call/jump signals.
    #[must_use]
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Self::Control(_))
    }

    /// Returns true if the error has already been appended to `runErrors`.
    #[must_use]
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled(_))
    }

    /// Marks the error as recorded. Control flow is never wrapped.
    #[must_use]
    pub fn into_handled(self) -> Self {
        match self {
            Self::Handled(_) | Self::Control(_) => self,
            other => Self::Handled(Box::new(other)),
        }
    }

    /// Strips the recorded marker, e.g. when crossing a context boundary.
    #[must_use]
    pub fn into_unhandled(self) -> Self {
        match self {
            Self::Handled(inner) => inner.into_unhandled(),
            other => other,
        }
    }

    /// The error with any recorded marker looked through.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Handled(inner) => inner.root(),
            other => other,
        }
    }

    /// Converts to a dictionary representation for event payloads.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert(
            "name".to_string(),
            serde_json::Value::String(self.kind_name().to_string()),
        );
        map.insert(
            "description".to_string(),
            serde_json::Value::String(self.root().to_string()),
        );
        map.insert(
            "kind".to_string(),
            serde_json::to_value(self.error_kind()).unwrap_or(serde_json::Value::Null),
        );
        map
    }
}

impl From<ControlFlow> for StepwiseError {
    fn from(signal: ControlFlow) -> Self {
        Self::Control(signal)
    }
}

/// Failure to resolve a formatting expression against the context.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormattingError {
    /// The expression references a key that is not in the context.
    #[error("Unable to format '{expression}' because {key} not found in the pipeline context.")]
    KeyNotFound {
        /// The missing key or index text.
        key: String,
        /// The full field expression being resolved.
        expression: String,
    },

    /// An intermediate value cannot be indexed.
    #[error("Unable to format '{expression}': {type_name} is not subscriptable.")]
    NotSubscriptable {
        /// The full field expression being resolved.
        expression: String,
        /// The type that was indexed.
        type_name: String,
    },

    /// A list or string index is past the end.
    #[error("Unable to format '{expression}': index {index} out of range.")]
    IndexOutOfRange {
        /// The full field expression being resolved.
        expression: String,
        /// The offending index.
        index: String,
    },

    /// The template itself is malformed.
    #[error("Malformed format string '{template}': {reason}")]
    Malformed {
        /// The template being parsed.
        template: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A `!expr` value failed to evaluate.
    #[error("{0}")]
    Expression(#[from] ExpressionError),

    /// Formatting recursed past the nesting limit.
    #[error("Formatting '{template}' exceeded the recursion limit of {limit}.")]
    RecursionLimit {
        /// The template being formatted when the limit was hit.
        template: String,
        /// The configured limit.
        limit: usize,
    },
}

impl FormattingError {
    /// The classification name of this formatting failure.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::KeyNotFound { .. } => "KeyNotInContextError",
            Self::NotSubscriptable { .. } => "TypeError",
            Self::IndexOutOfRange { .. } => "IndexError",
            Self::Malformed { .. } => "ValueError",
            Self::Expression(_) => "ExpressionError",
            Self::RecursionLimit { .. } => "RecursionError",
        }
    }

    /// Creates a malformed-template error.
    pub fn malformed(template: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            template: template.into(),
            reason: reason.into(),
        }
    }
}

/// A collaborator's required context input is missing or malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The key does not exist.
    #[error("context['{key}'] doesn't exist. It must exist for {caller}.")]
    KeyNotFound {
        /// The missing key.
        key: String,
        /// Who needed it.
        caller: String,
    },

    /// The key exists but is null.
    #[error("context['{key}'] must have a value for {caller}.")]
    NoValue {
        /// The empty key.
        key: String,
        /// Who needed it.
        caller: String,
    },

    /// The key holds the wrong shape of value.
    #[error("context['{key}'] must be {expected} for {caller}, found {found}.")]
    WrongType {
        /// The offending key.
        key: String,
        /// What was expected.
        expected: String,
        /// What was found.
        found: String,
        /// Who needed it.
        caller: String,
    },

    /// Any other invalid input.
    #[error("{0}")]
    Invalid(String),
}

impl ContextError {
    /// The classification name of this context failure.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::KeyNotFound { .. } => "KeyNotInContextError",
            Self::NoValue { .. } => "KeyInContextHasNoValueError",
            Self::WrongType { .. } | Self::Invalid(_) => "ContextError",
        }
    }
}

/// A dynamic expression or statement block failed to evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Error evaluating '{source_text}': {message}")]
pub struct ExpressionError {
    /// The source that failed.
    pub source_text: String,
    /// The evaluator's message.
    pub message: String,
}

impl ExpressionError {
    /// Creates a new expression error.
    pub fn new(source_text: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
            message: message.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = StepwiseError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::control::GroupInstruction;

    #[test]
    fn test_kind_name_uses_collaborator_kind() {
        let err = StepwiseError::step_failed("TimeoutError", "took too long");
        assert_eq!(err.kind_name(), "TimeoutError");
        assert_eq!(err.error_kind(), ErrorKind::StepExecution);
        assert_eq!(err.to_string(), "TimeoutError: took too long");
    }

    #[test]
    fn test_handled_delegates_classification() {
        let err = StepwiseError::Assertion("x".to_string()).into_handled();
        assert!(err.is_handled());
        assert_eq!(err.kind_name(), "AssertionError");
        assert_eq!(err.error_kind(), ErrorKind::Assertion);

        let unwrapped = err.into_unhandled();
        assert!(!unwrapped.is_handled());
    }

    #[test]
    fn test_handled_is_idempotent() {
        let err = StepwiseError::definition("bad").into_handled().into_handled();
        match err {
            StepwiseError::Handled(inner) => assert!(!inner.is_handled()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_control_flow_never_wrapped() {
        let err = StepwiseError::from(ControlFlow::Jump(GroupInstruction::new(vec![
            "g2".to_string(),
        ])))
        .into_handled();
        assert!(err.is_control_flow());
        assert_eq!(err.error_kind(), ErrorKind::ControlFlow);
    }

    #[test]
    fn test_formatting_kind_names() {
        let err = StepwiseError::from(FormattingError::KeyNotFound {
            key: "a".to_string(),
            expression: "{a}".to_string(),
        });
        assert_eq!(err.kind_name(), "KeyNotInContextError");
        assert_eq!(err.error_kind(), ErrorKind::Formatting);
    }

    #[test]
    fn test_pipeline_not_found_lists_locations() {
        let err = StepwiseError::PipelineNotFound {
            name: "child".to_string(),
            searched: vec!["/a/child.yaml".to_string(), "/b/child.yaml".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("/a/child.yaml"));
        assert!(message.contains("/b/child.yaml"));
    }

    #[test]
    fn test_to_dict() {
        let err = StepwiseError::Assertion("nope".to_string());
        let dict = err.to_dict();
        assert_eq!(dict.get("name"), Some(&serde_json::json!("AssertionError")));
        assert_eq!(dict.get("kind"), Some(&serde_json::json!("Assertion")));
    }
}
