//! Dynamic expression evaluation against the context.
//!
//! Evaluators see every context key as a free variable, may mutate existing
//! values in place, and never leak scratch bindings back into the context.
//! The default evaluator embeds the Rhai scripting language.

mod namespace;
mod rhai_engine;

pub use namespace::Namespace;
pub use rhai_engine::RhaiEvaluator;

use std::fmt::Debug;

use crate::context::{Map, Value};
use crate::errors::ExpressionError;

/// Evaluates dynamic expressions and statement blocks against context data.
pub trait ExpressionEvaluator: Send + Sync + Debug {
    /// Evaluates an expression and returns its value.
    ///
    /// Changes the expression makes to existing keys are written back; new
    /// bindings are discarded.
    fn evaluate(&self, expression: &str, context: &mut Map) -> Result<Value, ExpressionError>;

    /// Executes a statement block.
    ///
    /// Changes to existing keys are written back. New top-level bindings are
    /// discarded unless their names are listed in `exports`.
    fn execute(
        &self,
        code: &str,
        context: &mut Map,
        exports: &[String],
    ) -> Result<(), ExpressionError>;
}
