//! Pipeline definitions and execution.
//!
//! This module provides:
//! - Parsed pipeline definitions and step-groups
//! - The step decorator state machine (`while`, `foreach`, `run`, `skip`,
//!   `retry`, `swallow`, `onError`)
//! - Control-flow signals and the runner that interprets them

pub(crate) mod control;
mod definition;
mod retry;
pub(crate) mod runner;
mod step;
mod while_loop;


pub use control::{ControlFlow, GroupInstruction};
pub use definition::{PipelineDefinition, PipelineInfo, StepGroup, CONTEXT_PARSER_KEY};
pub use retry::{
    BackoffStrategy, RetryConfig, RetryDecision, RetryDecorator, SleepSchedule, RETRY_COUNTER_KEY,
};
pub use step::{Step, FOREACH_ITEM_KEY};
pub use while_loop::{WhileDecorator, WHILE_COUNTER_KEY};
