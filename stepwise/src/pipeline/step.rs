//! A single decorated step and its execution state machine.
//!
//! Decorators apply in a fixed order on every execution:
//!
//! ```text
//! in -> while -> foreach -> run -> skip -> retry -> [collaborator] -> swallow
//! ```
//!
//! Everything except `in` is formatted against the context at the last
//! possible moment, so earlier iterations can change later decisions.

use std::time::Duration;

use async_trait::async_trait;

use super::control::{ControlFlow, GroupInstruction};
use super::definition::reject_unknown;
use super::retry::{RetryDecision, RetryDecorator, RETRY_COUNTER_KEY};
use super::while_loop::{WhileDecorator, WHILE_COUNTER_KEY};
use crate::collaborators::Collaborator;
use crate::context::{Context, Map, RunErrorRecord, StepLocation, Value};
use crate::errors::StepwiseError;
use crate::invoker::PipelineInvoker;

/// Context key bound to the current `foreach` item.
pub const FOREACH_ITEM_KEY: &str = "i";

const STEP_KEYS: &[&str] = &[
    "name",
    "description",
    "comment",
    "in",
    "foreach",
    "while",
    "run",
    "skip",
    "retry",
    "swallow",
    "onError",
];

/// Runs the step-groups a `call` names, then hands control back to the
/// calling step.
#[async_trait]
pub(crate) trait GroupCaller: Send + Sync {
    async fn call_groups(
        &self,
        ctx: &mut Context,
        instruction: &GroupInstruction,
    ) -> Result<(), StepwiseError>;
}

/// One unit of work: a collaborator reference plus its decorators.
#[derive(Debug, Clone)]
pub struct Step {
    /// Name of the collaborator to invoke.
    pub name: String,
    /// Formatted and logged before the collaborator runs.
    pub description: Option<Value>,
    /// Free-form author notes. Never evaluated.
    pub comment: Option<String>,
    /// Written raw into the context once per execution, before any loop.
    pub in_parameters: Option<Map>,
    /// Items to loop over, binding each to `i`.
    pub foreach: Option<Value>,
    /// Loop until a condition holds or a cap is reached.
    pub while_decorator: Option<WhileDecorator>,
    /// The collaborator only runs if this is true.
    pub run: Value,
    /// The collaborator does not run if this is true.
    pub skip: Value,
    /// Record failures and carry on instead of raising.
    pub swallow: Value,
    /// Re-run the collaborator on failure.
    pub retry: Option<RetryDecorator>,
    /// Payload attached to the run-error record on failure.
    pub on_error: Option<Value>,
    location: StepLocation,
}

impl Step {
    /// Creates an undecorated step.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            comment: None,
            in_parameters: None,
            foreach: None,
            while_decorator: None,
            run: Value::Bool(true),
            skip: Value::Bool(false),
            swallow: Value::Bool(false),
            retry: None,
            on_error: None,
            location: StepLocation::new("", 0),
        }
    }

    /// Sets the source coordinates.
    #[must_use]
    pub fn at(mut self, location: StepLocation) -> Self {
        self.location = location;
        self
    }

    /// Sets the `swallow` decorator.
    #[must_use]
    pub fn with_swallow(mut self, swallow: impl Into<Value>) -> Self {
        self.swallow = swallow.into();
        self
    }

    /// Sets the `foreach` decorator.
    #[must_use]
    pub fn with_foreach(mut self, items: impl Into<Value>) -> Self {
        self.foreach = Some(items.into());
        self
    }

    /// Sets the `run` decorator.
    #[must_use]
    pub fn with_run(mut self, run: impl Into<Value>) -> Self {
        self.run = run.into();
        self
    }

    /// Where the step is declared.
    #[must_use]
    pub fn location(&self) -> &StepLocation {
        &self.location
    }

    /// Parses a step entry: a bare collaborator name, or a mapping.
    pub fn from_value(value: &Value, group: &str, index: usize) -> Result<Self, StepwiseError> {
        let location = StepLocation::new(group, index);
        let map = match value {
            Value::String(name) if !name.is_empty() => {
                return Ok(Self::new(name.clone()).at(location));
            }
            Value::Map(map) => map,
            other => {
                return Err(StepwiseError::definition(format!(
                    "step {index} in '{group}' must be a collaborator name or a mapping, found {}",
                    other.type_name()
                )))
            }
        };
        reject_unknown(map, STEP_KEYS, "step")?;

        let name = match map.get("name") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            Some(_) => {
                return Err(StepwiseError::definition(format!(
                    "step {index} in '{group}' must have a non-empty string name"
                )))
            }
            None => {
                return Err(StepwiseError::definition(format!(
                    "step {index} in '{group}' is missing the required name"
                )))
            }
        };

        let present = |key: &str| map.get(key).filter(|v| !v.is_null());
        let in_parameters = match present("in") {
            None => None,
            Some(Value::Map(values)) => Some(values.clone()),
            Some(other) => {
                return Err(StepwiseError::definition(format!(
                    "step '{name}' in must be a mapping, found {}",
                    other.type_name()
                )))
            }
        };

        let mut step = Self::new(name).at(location);
        step.in_parameters = in_parameters;
        step.description = present("description").cloned();
        step.comment = present("comment").map(ToString::to_string);
        step.foreach = present("foreach").cloned();
        step.while_decorator = present("while").map(WhileDecorator::from_value).transpose()?;
        step.retry = present("retry").map(RetryDecorator::from_value).transpose()?;
        step.on_error = present("onError").cloned();
        if let Some(run) = map.get("run") {
            step.run = run.clone();
        }
        if let Some(skip) = map.get("skip") {
            step.skip = skip.clone();
        }
        if let Some(swallow) = map.get("swallow") {
            step.swallow = swallow.clone();
        }
        Ok(step)
    }

    /// Runs the step with all of its decorators.
    ///
    /// A `call` raised by the collaborator is returned as a control signal.
    pub async fn run(
        &self,
        ctx: &mut Context,
        collaborator: &dyn Collaborator,
        invoker: &PipelineInvoker,
    ) -> Result<(), StepwiseError> {
        self.run_with_calls(ctx, collaborator, invoker, None).await
    }

    /// Runs the step, executing any `call` through `calls` inside the
    /// current iteration so loops resume afterwards.
    pub(crate) async fn run_with_calls(
        &self,
        ctx: &mut Context,
        collaborator: &dyn Collaborator,
        invoker: &PipelineInvoker,
        calls: Option<&dyn GroupCaller>,
    ) -> Result<(), StepwiseError> {
        tracing::debug!(step = %self.name, "starting step");
        if let Some(values) = &self.in_parameters {
            tracing::debug!(step = %self.name, count = values.len(), "Updating context with in parameters");
            ctx.update(values);
        }

        match &self.while_decorator {
            Some(decorator) => {
                self.while_loop(ctx, decorator, collaborator, invoker, calls)
                    .await
            }
            None => {
                self.foreach_or_conditional(ctx, collaborator, invoker, calls)
                    .await
            }
        }
    }

    async fn while_loop(
        &self,
        ctx: &mut Context,
        decorator: &WhileDecorator,
        collaborator: &dyn Collaborator,
        invoker: &PipelineInvoker,
        calls: Option<&dyn GroupCaller>,
    ) -> Result<(), StepwiseError> {
        let plan = decorator.plan(ctx)?;
        if plan.max.is_some_and(|max| max < 1) {
            tracing::info!(step = %self.name, "max is less than 1. while decorator will not run");
            return Ok(());
        }

        let mut counter: i64 = 0;
        loop {
            counter += 1;
            ctx.insert(WHILE_COUNTER_KEY, Value::Int(counter));
            tracing::debug!(step = %self.name, counter, "while: running step");

            self.foreach_or_conditional(ctx, collaborator, invoker, calls)
                .await?;

            if decorator.should_stop(ctx)? {
                tracing::info!(step = %self.name, counter, "while loop done, stop condition evaluated true");
                return Ok(());
            }
            if plan.max.is_some_and(|max| counter >= max) {
                return decorator.exhausted(&plan);
            }
            if !plan.sleep.is_zero() {
                tracing::debug!(step = %self.name, sleep = ?plan.sleep, "while: sleeping");
                tokio::time::sleep(plan.sleep).await;
            }
        }
    }

    async fn foreach_or_conditional(
        &self,
        ctx: &mut Context,
        collaborator: &dyn Collaborator,
        invoker: &PipelineInvoker,
        calls: Option<&dyn GroupCaller>,
    ) -> Result<(), StepwiseError> {
        let Some(foreach) = self.foreach.as_ref().filter(|raw| raw.is_truthy()) else {
            return self.run_conditional(ctx, collaborator, invoker, calls).await;
        };

        let items = ctx.get_formatted_list(foreach, "foreach")?;
        tracing::info!(step = %self.name, count = items.len(), "foreach decorator will loop");
        for item in items {
            tracing::debug!(step = %self.name, item = %item, "foreach: running step");
            ctx.insert(FOREACH_ITEM_KEY, item);
            self.run_conditional(ctx, collaborator, invoker, calls).await?;
        }
        Ok(())
    }

    async fn run_conditional(
        &self,
        ctx: &mut Context,
        collaborator: &dyn Collaborator,
        invoker: &PipelineInvoker,
        calls: Option<&dyn GroupCaller>,
    ) -> Result<(), StepwiseError> {
        let run = ctx.get_formatted_bool(&self.run)?;
        let skip = ctx.get_formatted_bool(&self.skip)?;
        let swallow = ctx.get_formatted_bool(&self.swallow)?;

        if !run || skip {
            let reason = if run { "skip is True" } else { "run is False" };
            tracing::info!(step = %self.name, "{} not running because {reason}.", self.name);
            invoker.emit(
                "step.skipped",
                serde_json::json!({"step": self.name, "reason": reason}),
            )
            .await;
            return Ok(());
        }

        if let Some(description) = &self.description {
            let description = ctx.get_formatted_value(description)?;
            tracing::info!(step = %self.name, "{}: {description}", self.name);
        }

        let outcome = match &self.retry {
            Some(retry) => {
                self.retry_loop(ctx, retry, collaborator, invoker, calls)
                    .await
            }
            None => self.invoke(ctx, collaborator, invoker, calls).await,
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(err) if err.is_control_flow() => Err(err),
            Err(err) if err.is_handled() => {
                if swallow {
                    tracing::warn!(step = %self.name, error = %err, "Ignoring error because swallow is True for this step.");
                    ctx.mark_last_error_swallowed();
                    Ok(())
                } else {
                    Err(err)
                }
            }
            Err(err) => {
                self.record_failure(ctx, &err, swallow);
                if swallow {
                    tracing::warn!(
                        step = %self.name,
                        error = %err,
                        kind = %err.kind_name(),
                        "Ignoring error because swallow is True for this step."
                    );
                    Ok(())
                } else {
                    Err(err.into_handled())
                }
            }
        }
    }

    async fn retry_loop(
        &self,
        ctx: &mut Context,
        decorator: &RetryDecorator,
        collaborator: &dyn Collaborator,
        invoker: &PipelineInvoker,
        calls: Option<&dyn GroupCaller>,
    ) -> Result<(), StepwiseError> {
        let config = decorator.resolve(ctx)?;
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            ctx.insert(
                RETRY_COUNTER_KEY,
                Value::Int(i64::try_from(attempt).unwrap_or(i64::MAX)),
            );
            tracing::debug!(step = %self.name, attempt, "retry: running step");

            let err = match self.invoke(ctx, collaborator, invoker, calls).await {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(step = %self.name, attempt, "retry: step succeeded");
                    }
                    return Ok(());
                }
                Err(err) => err,
            };

            match config.should_retry(&err, attempt) {
                RetryDecision::Retry(delay) => {
                    tracing::warn!(
                        step = %self.name,
                        attempt,
                        error = %err,
                        delay_ms = duration_ms(delay),
                        "retry: step failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                RetryDecision::GiveUp => {
                    tracing::error!(step = %self.name, attempt, "retry: max attempts exhausted, raising last error");
                    return Err(err);
                }
                RetryDecision::NotRetryable => return Err(err),
            }
        }
    }

    /// Runs the collaborator once. A `call` it raises runs here, and the
    /// context key that described it is put back afterwards so groups that
    /// reuse the key do not leak into the next iteration.
    async fn invoke(
        &self,
        ctx: &mut Context,
        collaborator: &dyn Collaborator,
        invoker: &PipelineInvoker,
        calls: Option<&dyn GroupCaller>,
    ) -> Result<(), StepwiseError> {
        let (instruction, calls) = match (collaborator.run(ctx, invoker).await, calls) {
            (Err(StepwiseError::Control(ControlFlow::Call(instruction))), Some(calls)) => {
                (instruction, calls)
            }
            (outcome, _) => return outcome,
        };

        tracing::debug!(step = %self.name, groups = ?instruction.groups, "call: calling step-groups");
        let outcome = calls.call_groups(ctx, &instruction).await;
        if let Some((key, value)) = &instruction.restore {
            ctx.insert(key.clone(), value.clone());
        }
        tracing::debug!(step = %self.name, groups = ?instruction.groups, "call: done, resuming");
        outcome
    }

    fn record_failure(&self, ctx: &mut Context, err: &StepwiseError, swallowed: bool) {
        let mut location = self.location.clone();
        if let Some(frame) = ctx.current_pipeline() {
            location = location.with_pipeline(frame.name.clone());
        }
        let mut record = RunErrorRecord::from_error(err)
            .with_location(location)
            .with_step(self.name.clone())
            .with_swallowed(swallowed);
        if let Some(on_error) = &self.on_error {
            let payload = match ctx.get_formatted_value(on_error) {
                Ok(payload) => payload,
                Err(format_err) => {
                    tracing::warn!(step = %self.name, error = %format_err, "onError could not be formatted, keeping it raw");
                    on_error.clone()
                }
            };
            record = record.with_custom_error(payload);
        }
        ctx.record_error(record);
    }
}

fn duration_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingCollaborator, RecordingCollaborator};
    use serde_json::json;

    fn step(value: serde_json::Value) -> Step {
        Step::from_value(&Value::from(value), "steps", 0).unwrap()
    }

    #[test]
    fn test_parse_bare_and_complex() {
        let bare = Step::from_value(&Value::from("my.step"), "g", 3).unwrap();
        assert_eq!(bare.name, "my.step");
        assert_eq!(bare.location(), &StepLocation::new("g", 3));
        assert_eq!(bare.run, Value::Bool(true));

        let complex = step(json!({
            "name": "x",
            "comment": "notes",
            "in": {"a": 1},
            "while": {"max": 2},
            "retry": {"max": 3},
            "swallow": true
        }));
        assert_eq!(complex.comment.as_deref(), Some("notes"));
        assert!(complex.while_decorator.is_some());
        assert!(complex.retry.is_some());
        assert_eq!(complex.swallow, Value::Bool(true));
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            json!({"description": "no name"}),
            json!({"name": "x", "bogus": 1}),
            json!({"name": "x", "in": [1]}),
            json!(42),
        ] {
            let err = Step::from_value(&Value::from(bad), "steps", 0).unwrap_err();
            assert_eq!(err.kind_name(), "PipelineDefinitionError");
        }
    }

    #[tokio::test]
    async fn test_in_written_raw_before_loop() {
        let invoker = PipelineInvoker::new();
        let recorder = RecordingCollaborator::new("rec");
        let step = step(json!({"name": "rec", "in": {"msg": "{not_formatted}"}}));
        let mut ctx = Context::new();
        step.run(&mut ctx, &recorder, &invoker).await.unwrap();
        assert_eq!(ctx.get("msg"), Some(&Value::from("{not_formatted}")));
        assert_eq!(recorder.calls(), 1);
    }

    #[tokio::test]
    async fn test_foreach_binds_item_and_reevaluates_run() {
        let invoker = PipelineInvoker::new();
        let recorder = RecordingCollaborator::new("rec").recording_key(FOREACH_ITEM_KEY);
        let step = Step::new("rec")
            .with_foreach(Value::from(json!([1, 0, 2])))
            .with_run("{i}");
        let mut ctx = Context::new();
        step.run(&mut ctx, &recorder, &invoker).await.unwrap();
        assert_eq!(recorder.journal(), vec!["rec:1", "rec:2"]);
        assert_eq!(ctx.get(FOREACH_ITEM_KEY), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn test_foreach_over_formatted_list() {
        let invoker = PipelineInvoker::new();
        let recorder = RecordingCollaborator::new("rec").recording_key(FOREACH_ITEM_KEY);
        let step = step(json!({"name": "rec", "foreach": "{items}"}));
        let mut ctx = Context::from_json(json!({"items": ["a", "b"]}));
        step.run(&mut ctx, &recorder, &invoker).await.unwrap();
        assert_eq!(recorder.journal(), vec!["rec:a", "rec:b"]);
    }

    #[tokio::test]
    async fn test_while_max_runs_exactly_max_times() {
        let invoker = PipelineInvoker::new();
        let failing = FailingCollaborator::always("flaky", "ValueError");
        let step = step(json!({"name": "flaky", "while": {"max": 3}, "swallow": true}));
        let mut ctx = Context::new();
        step.run(&mut ctx, &failing, &invoker).await.unwrap();
        assert_eq!(failing.calls(), 3);
        assert_eq!(ctx.get(WHILE_COUNTER_KEY), Some(&Value::Int(3)));
        assert_eq!(ctx.run_errors().len(), 3);
    }

    #[tokio::test]
    async fn test_while_stop_evaluated_after_iteration() {
        let invoker = PipelineInvoker::new();
        let recorder = RecordingCollaborator::new("rec");
        let step = step(json!({"name": "rec", "while": {"stop": "{done}", "max": 10}}));
        let mut ctx = Context::from_json(json!({"done": true}));
        step.run(&mut ctx, &recorder, &invoker).await.unwrap();
        assert_eq!(recorder.calls(), 1);
    }

    #[tokio::test]
    async fn test_while_max_below_one_never_runs() {
        let invoker = PipelineInvoker::new();
        let recorder = RecordingCollaborator::new("rec");
        let step = step(json!({"name": "rec", "while": {"max": 0, "errorOnMax": true}}));
        let mut ctx = Context::new();
        step.run(&mut ctx, &recorder, &invoker).await.unwrap();
        assert_eq!(recorder.calls(), 0);
    }

    #[tokio::test]
    async fn test_while_error_on_max() {
        let invoker = PipelineInvoker::new();
        let recorder = RecordingCollaborator::new("rec");
        let step = step(json!({
            "name": "rec",
            "while": {"max": 2, "stop": "{done}", "errorOnMax": true}
        }));
        let mut ctx = Context::from_json(json!({"done": false}));
        let err = step.run(&mut ctx, &recorder, &invoker).await.unwrap_err();
        assert_eq!(err.kind_name(), "LoopMaxExhaustedError");
        assert_eq!(recorder.calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_on_excludes_other_kinds() {
        let invoker = PipelineInvoker::new();
        let failing = FailingCollaborator::always("flaky", "ValueError");
        let step = step(json!({"name": "flaky", "retry": {"max": 2, "retryOn": ["TimeoutError"]}}));
        let mut ctx = Context::new();
        let err = step.run(&mut ctx, &failing, &invoker).await.unwrap_err();
        assert_eq!(err.kind_name(), "ValueError");
        assert_eq!(failing.calls(), 1);
        assert_eq!(ctx.get(RETRY_COUNTER_KEY), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let invoker = PipelineInvoker::new();
        let failing = FailingCollaborator::new("flaky", "TimeoutError", 2);
        let step = step(json!({"name": "flaky", "retry": {"max": 5}}));
        let mut ctx = Context::new();
        step.run(&mut ctx, &failing, &invoker).await.unwrap();
        assert_eq!(failing.calls(), 3);
        assert_eq!(ctx.get(RETRY_COUNTER_KEY), Some(&Value::Int(3)));
        assert!(ctx.run_errors().is_empty());
    }

    #[tokio::test]
    async fn test_retry_exhausted_then_swallowed() {
        let invoker = PipelineInvoker::new();
        let failing = FailingCollaborator::always("flaky", "TimeoutError");
        let step = step(json!({
            "name": "flaky",
            "retry": {"max": 2},
            "swallow": true,
            "onError": {"code": "{code}"}
        }));
        let mut ctx = Context::from_json(json!({"code": 42}));
        step.run(&mut ctx, &failing, &invoker).await.unwrap();
        assert_eq!(failing.calls(), 2);

        let records = ctx.run_errors();
        assert_eq!(records.len(), 1);
        assert!(records[0].swallowed);
        assert_eq!(records[0].name, "TimeoutError");
        assert_eq!(records[0].step.as_deref(), Some("flaky"));
        assert_eq!(
            records[0].custom_error.as_ref().map(Value::to_json),
            Some(json!({"code": 42}))
        );
    }

    #[tokio::test]
    async fn test_unswallowed_error_is_recorded_then_marked_handled() {
        let invoker = PipelineInvoker::new();
        let failing = FailingCollaborator::always("boom", "ValueError");
        let step = step(json!("boom"));
        let mut ctx = Context::new();
        let err = step.run(&mut ctx, &failing, &invoker).await.unwrap_err();
        assert!(err.is_handled());
        assert_eq!(ctx.run_errors().len(), 1);
        assert!(!ctx.run_errors()[0].swallowed);
    }

    #[tokio::test]
    async fn test_skip_and_run_false() {
        let invoker = PipelineInvoker::new();
        let recorder = RecordingCollaborator::new("rec");
        let mut ctx = Context::from_json(json!({"yes": "True", "no": 0}));

        step(json!({"name": "rec", "skip": "{yes}"}))
            .run(&mut ctx, &recorder, &invoker)
            .await
            .unwrap();
        step(json!({"name": "rec", "run": "{no}"}))
            .run(&mut ctx, &recorder, &invoker)
            .await
            .unwrap();
        assert_eq!(recorder.calls(), 0);
    }

    #[tokio::test]
    async fn test_call_without_runner_is_returned_as_signal() {
        let invoker = PipelineInvoker::new();
        let step = step(json!({"name": "call", "foreach": [1, 2], "in": {"call": "sg"}}));
        let mut ctx = Context::new();
        let err = step
            .run(&mut ctx, &crate::collaborators::builtin::CallStep, &invoker)
            .await
            .unwrap_err();
        assert!(matches!(err, StepwiseError::Control(ControlFlow::Call(_))));
        assert_eq!(ctx.get(FOREACH_ITEM_KEY), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_swallow_never_catches_control_flow() {
        let invoker = PipelineInvoker::new();
        let step = Step::new("stop").with_swallow(true);
        let mut ctx = Context::new();
        let err = step
            .run(&mut ctx, &crate::collaborators::builtin::StopStep, &invoker)
            .await
            .unwrap_err();
        assert!(err.is_control_flow());
        assert!(ctx.run_errors().is_empty());
    }
}
