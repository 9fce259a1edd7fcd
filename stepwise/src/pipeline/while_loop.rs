//! The `while` step decorator.

use std::time::Duration;

use super::definition::reject_unknown;
use super::retry::seconds;
use crate::context::{Context, Value};
use crate::errors::StepwiseError;

/// Context key holding the current iteration number.
pub const WHILE_COUNTER_KEY: &str = "whileCounter";

const WHILE_KEYS: &[&str] = &["errorOnMax", "max", "sleep", "stop"];

/// Repeats a step until `stop` is true or `max` iterations have run.
#[derive(Debug, Clone, PartialEq)]
pub struct WhileDecorator {
    /// Raise `LoopMaxExhaustedError` when `max` runs out before `stop`.
    pub error_on_max: Value,
    /// Iteration cap.
    pub max: Option<Value>,
    /// Seconds to sleep between iterations.
    pub sleep: Value,
    /// Evaluated after each iteration; the loop ends once it is true.
    pub stop: Option<Value>,
}

/// A `while` decorator formatted for one step execution.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WhilePlan {
    pub max: Option<i64>,
    pub sleep: Duration,
    pub error_on_max: bool,
}

impl WhileDecorator {
    /// Parses the decorator mapping. At least one of `stop` and `max` is
    /// required.
    pub fn from_value(value: &Value) -> Result<Self, StepwiseError> {
        let Value::Map(map) = value else {
            return Err(StepwiseError::definition("while decorator must be a mapping"));
        };
        reject_unknown(map, WHILE_KEYS, "while decorator")?;

        let decorator = Self {
            error_on_max: map.get("errorOnMax").cloned().unwrap_or(Value::Bool(false)),
            max: map.get("max").filter(|v| !v.is_null()).cloned(),
            sleep: map.get("sleep").cloned().unwrap_or(Value::Int(0)),
            stop: map.get("stop").filter(|v| !v.is_null()).cloned(),
        };
        if decorator.max.is_none() && decorator.stop.is_none() {
            return Err(StepwiseError::definition(
                "the while decorator must have either max or stop, or both",
            ));
        }
        Ok(decorator)
    }

    /// Formats the loop settings and resets `whileCounter`.
    pub(crate) fn plan(&self, ctx: &mut Context) -> Result<WhilePlan, StepwiseError> {
        ctx.insert(WHILE_COUNTER_KEY, Value::Int(0));
        let error_on_max = ctx.get_formatted_bool(&self.error_on_max)?;
        let sleep = seconds(ctx.get_formatted_float(&self.sleep, "while.sleep")?);
        let max = match &self.max {
            Some(max) => Some(ctx.get_formatted_int(max, "while.max")?),
            None => None,
        };
        match max {
            Some(max) => tracing::info!(max, ?sleep, stop = ?self.stop, "while decorator will loop"),
            None => tracing::info!(?sleep, stop = ?self.stop, "while decorator will loop until stop"),
        }
        Ok(WhilePlan {
            max,
            sleep,
            error_on_max,
        })
    }

    /// Evaluates `stop` after an iteration.
    pub(crate) fn should_stop(&self, ctx: &mut Context) -> Result<bool, StepwiseError> {
        match &self.stop {
            Some(stop) => Ok(ctx.get_formatted_bool(stop)?),
            None => Ok(false),
        }
    }

    /// Result of running out of iterations.
    pub(crate) fn exhausted(&self, plan: &WhilePlan) -> Result<(), StepwiseError> {
        let max = plan.max.unwrap_or_default();
        if !plan.error_on_max {
            if let Some(stop) = &self.stop {
                tracing::info!(max, stop = %stop, "while decorator looped max times and stop never evaluated true");
            }
            return Ok(());
        }
        tracing::error!(max, "Exhausted while loop and errorOnMax is true");
        Err(StepwiseError::LoopMaxExhausted(match &self.stop {
            Some(stop) => format!("while loop reached {max} and {stop} never evaluated to True."),
            None => format!("while loop reached {max}."),
        }))
    }
}
