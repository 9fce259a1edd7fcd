//! The mutable key/value store a pipeline run executes against.
//!
//! This module provides:
//! - [`Value`], the dynamically typed context value
//! - [`Context`], the ordered store plus its run-error log and call-frame
//!   reference
//! - the formatting engine (`{key}` interpolation) and the set / default /
//!   merge write semantics

mod formatting;
mod merge;
mod run_errors;
mod value;


use std::sync::Arc;

pub use formatting::{parse_bool_text, MAX_FORMAT_DEPTH};
pub use run_errors::{RunErrorRecord, StepLocation};
pub use value::{Map, Value};

use crate::errors::ContextError;
use crate::expressions::{ExpressionEvaluator, RhaiEvaluator};
use crate::invoker::PipelineCallFrame;

/// Context key that mirrors the run-error log.
pub const RUN_ERRORS_KEY: &str = "runErrors";

/// The shared mutable store for one pipeline call-stack.
///
/// A context belongs to exactly one call-stack at a time. Isolated child
/// pipelines get their own context, which is discarded when they finish.
#[derive(Debug, Clone)]
pub struct Context {
    data: Map,
    run_errors: Vec<RunErrorRecord>,
    current_frame: Option<Arc<PipelineCallFrame>>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates an empty context with the default expression evaluator.
    #[must_use]
    pub fn new() -> Self {
        Self::from_map(Map::new())
    }

    /// Creates a context seeded with `data`.
    #[must_use]
    pub fn from_map(data: Map) -> Self {
        Self {
            data,
            run_errors: Vec::new(),
            current_frame: None,
            evaluator: Arc::new(RhaiEvaluator::new()),
        }
    }

    /// Creates a context from a JSON object. Anything else gives an empty
    /// context.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match Value::from(value) {
            Value::Map(map) => Self::from_map(map),
            _ => Self::new(),
        }
    }

    /// Replaces the expression evaluator.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Creates an isolated context sharing only this context's evaluator.
    #[must_use]
    pub fn isolated(&self, seed: Map) -> Self {
        Self {
            data: seed,
            run_errors: Vec::new(),
            current_frame: self.current_frame.clone(),
            evaluator: Arc::clone(&self.evaluator),
        }
    }

    /// The expression evaluator used by `!expr` values and `exec` steps.
    #[must_use]
    pub fn evaluator(&self) -> &Arc<dyn ExpressionEvaluator> {
        &self.evaluator
    }

    /// Gets a raw value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Gets a raw value mutably.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.data.get_mut(key)
    }

    /// Returns true if the key exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Inserts a raw value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.data.insert(key.into(), value.into())
    }

    /// Removes a key, keeping the order of the rest.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.shift_remove(key)
    }

    /// Writes every entry of `values` raw, without formatting.
    pub fn update(&mut self, values: &Map) {
        for (key, value) in values {
            self.data.insert(key.clone(), value.clone());
        }
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if there are no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }

    /// Borrows the underlying mapping.
    #[must_use]
    pub fn data(&self) -> &Map {
        &self.data
    }

    /// Consumes the context, returning its mapping.
    #[must_use]
    pub fn into_map(self) -> Map {
        self.data
    }

    /// The run-error log, oldest first.
    #[must_use]
    pub fn run_errors(&self) -> &[RunErrorRecord] {
        &self.run_errors
    }

    /// Appends to the run-error log and refreshes the `runErrors` key.
    pub fn record_error(&mut self, record: RunErrorRecord) {
        tracing::debug!(
            name = %record.name,
            swallowed = record.swallowed,
            "Recording run error"
        );
        self.run_errors.push(record);
        self.mirror_run_errors();
    }

    /// Flags the most recent run-error as swallowed, for failures recorded
    /// deeper down and then swallowed by an enclosing step.
    pub fn mark_last_error_swallowed(&mut self) {
        if let Some(record) = self.run_errors.last_mut() {
            record.swallowed = true;
            self.mirror_run_errors();
        }
    }

    fn mirror_run_errors(&mut self) {
        let mirrored = self.run_errors.iter().map(RunErrorRecord::to_value).collect();
        self.data.insert(RUN_ERRORS_KEY.to_string(), Value::List(mirrored));
    }

    /// The top of the pipeline call-stack, if a pipeline is running.
    #[must_use]
    pub fn current_pipeline(&self) -> Option<&Arc<PipelineCallFrame>> {
        self.current_frame.as_ref()
    }

    pub(crate) fn replace_frame(
        &mut self,
        frame: Option<Arc<PipelineCallFrame>>,
    ) -> Option<Arc<PipelineCallFrame>> {
        std::mem::replace(&mut self.current_frame, frame)
    }

    /// Fails unless `key` exists.
    pub fn assert_key_exists(&self, key: &str, caller: &str) -> Result<&Value, ContextError> {
        self.data.get(key).ok_or_else(|| ContextError::KeyNotFound {
            key: key.to_string(),
            caller: caller.to_string(),
        })
    }

    /// Fails unless `key` exists and is not null.
    pub fn assert_key_has_value(&self, key: &str, caller: &str) -> Result<&Value, ContextError> {
        let value = self.assert_key_exists(key, caller)?;
        if value.is_null() {
            return Err(ContextError::NoValue {
                key: key.to_string(),
                caller: caller.to_string(),
            });
        }
        Ok(value)
    }

    /// Fails unless `parent` is a mapping holding a non-null `child`.
    pub fn assert_child_key_has_value(
        &self,
        parent: &str,
        child: &str,
        caller: &str,
    ) -> Result<&Value, ContextError> {
        let container = self.assert_key_has_value(parent, caller)?;
        let Value::Map(map) = container else {
            return Err(ContextError::WrongType {
                key: parent.to_string(),
                expected: "a mapping".to_string(),
                found: container.type_name().to_string(),
                caller: caller.to_string(),
            });
        };
        match map.get(child) {
            None => Err(ContextError::KeyNotFound {
                key: format!("{parent}.{child}"),
                caller: caller.to_string(),
            }),
            Some(Value::Null) => Err(ContextError::NoValue {
                key: format!("{parent}.{child}"),
                caller: caller.to_string(),
            }),
            Some(value) => Ok(value),
        }
    }
}
