//! Built-in collaborators.
//!
//! These are engine plumbing rather than business logic: control-flow
//! signals, the three context write semantics, assertions, inline code and
//! child pipeline invocation.

mod assert;
mod exec;
mod flow;
mod pype;
mod write;

pub use assert::AssertStep;
pub use exec::ExecStep;
pub use flow::{CallStep, JumpStep, StopPipelineStep, StopStep, StopStepGroupStep, SwitchStep};
pub use pype::{ChildInvocation, OutMapping, PypeStep};
pub use write::{ContextMergeStep, DefaultStep, SetStep};

use std::sync::Arc;

use super::CollaboratorRegistry;
use crate::context::{Context, Map, Value};
use crate::errors::{ContextError, StepwiseError};

/// Registers every built-in collaborator.
pub fn register_all(registry: &CollaboratorRegistry) {
    registry.register(Arc::new(CallStep));
    registry.register(Arc::new(JumpStep));
    registry.register(Arc::new(SwitchStep));
    registry.register(Arc::new(StopStep));
    registry.register(Arc::new(StopPipelineStep));
    registry.register(Arc::new(StopStepGroupStep));
    registry.register(Arc::new(SetStep));
    registry.register(Arc::new(DefaultStep));
    registry.register(Arc::new(ContextMergeStep));
    registry.register(Arc::new(AssertStep));
    registry.register(Arc::new(ExecStep));
    registry.register(Arc::new(PypeStep));
}

/// Borrows the raw mapping stored at `key`.
fn mapping_input<'a>(ctx: &'a Context, key: &str, caller: &str) -> Result<&'a Map, StepwiseError> {
    match ctx.assert_key_has_value(key, caller)? {
        Value::Map(map) => Ok(map),
        other => Err(ContextError::WrongType {
            key: key.to_string(),
            expected: "a mapping".to_string(),
            found: other.type_name().to_string(),
            caller: caller.to_string(),
        }
        .into()),
    }
}
