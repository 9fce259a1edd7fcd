//! Expression evaluator backed by the Rhai scripting engine.

use std::fmt;

use rhai::{Dynamic, Engine};

use super::namespace::{from_dynamic, Namespace};
use super::ExpressionEvaluator;
use crate::context::{Map, Value};
use crate::errors::ExpressionError;

/// Evaluates `!expr` values and `exec` blocks as Rhai scripts.
///
/// Closures capture context keys like any other outer variable, so nested
/// scopes can read several keys at once. Arrays and object maps taken from
/// the context can be mutated in place and the change persists.
pub struct RhaiEvaluator {
    engine: Engine,
}

impl RhaiEvaluator {
    /// Creates an evaluator with a default engine.
    #[must_use]
    pub fn new() -> Self {
        Self::with_engine(Engine::new())
    }

    /// Creates an evaluator around a preconfigured engine.
    #[must_use]
    pub fn with_engine(engine: Engine) -> Self {
        Self { engine }
    }
}

impl Default for RhaiEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RhaiEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RhaiEvaluator").finish_non_exhaustive()
    }
}

impl ExpressionEvaluator for RhaiEvaluator {
    fn evaluate(&self, expression: &str, context: &mut Map) -> Result<Value, ExpressionError> {
        let mut namespace = Namespace::build(context);
        let result = self
            .engine
            .eval_with_scope::<Dynamic>(namespace.scope_mut(), expression);
        namespace.commit(&[]);
        result
            .map(from_dynamic)
            .map_err(|e| ExpressionError::new(expression, e.to_string()))
    }

    fn execute(
        &self,
        code: &str,
        context: &mut Map,
        exports: &[String],
    ) -> Result<(), ExpressionError> {
        let mut namespace = Namespace::build(context);
        let result = self.engine.run_with_scope(namespace.scope_mut(), code);
        match result {
            Ok(()) => {
                namespace.commit(exports);
                Ok(())
            }
            Err(e) => {
                namespace.commit(&[]);
                Err(ExpressionError::new(code, e.to_string()))
            }
        }
    }
}
