//! The `retry` step decorator and its backoff strategies.
//!
//! A step with `retry` re-invokes its collaborator until it succeeds, `max`
//! attempts are used up, or the error is excluded by `stopOn`/`retryOn`.
//! Control-flow signals are never retried.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::context::{Context, Value};
use crate::errors::StepwiseError;

/// Context key holding the current attempt number.
pub const RETRY_COUNTER_KEY: &str = "retryCounter";

/// Backoff strategy for retry delays. `n` is the 1-based attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// delay = sleep, or the next entry of a sleep list
    #[default]
    Fixed,
    /// fixed, randomized between sleep * jrc and sleep
    Jitter,
    /// delay = sleep * n
    Linear,
    /// linear, randomized
    LinearJitter,
    /// delay = sleep * base^n
    Exponential,
    /// exponential, randomized
    ExponentialJitter,
}

impl BackoffStrategy {
    /// Returns true for the randomized variants.
    #[must_use]
    pub fn is_jittered(self) -> bool {
        matches!(
            self,
            Self::Jitter | Self::LinearJitter | Self::ExponentialJitter
        )
    }
}

impl FromStr for BackoffStrategy {
    type Err = StepwiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "jitter" => Ok(Self::Jitter),
            "linear" => Ok(Self::Linear),
            "linearjitter" => Ok(Self::LinearJitter),
            "exponential" => Ok(Self::Exponential),
            "exponentialjitter" => Ok(Self::ExponentialJitter),
            other => Err(StepwiseError::definition(format!(
                "unknown retry backoff '{other}'"
            ))),
        }
    }
}

/// Sleep interval(s) in seconds.
#[derive(Debug, Clone, PartialEq)]
pub enum SleepSchedule {
    /// The same interval every time.
    Interval(f64),
    /// One interval per attempt; the last one repeats.
    Sequence(Vec<f64>),
}

impl Default for SleepSchedule {
    fn default() -> Self {
        Self::Interval(0.0)
    }
}

impl SleepSchedule {
    fn for_attempt(&self, attempt: u64) -> f64 {
        match self {
            Self::Interval(seconds) => *seconds,
            Self::Sequence(seconds) => {
                let position = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
                seconds
                    .get(position)
                    .or_else(|| seconds.last())
                    .copied()
                    .unwrap_or(0.0)
            }
        }
    }

    fn base(&self) -> f64 {
        match self {
            Self::Interval(seconds) => *seconds,
            Self::Sequence(seconds) => seconds.first().copied().unwrap_or(0.0),
        }
    }
}

/// Resolved retry behavior for one step execution.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum attempts. `None` retries until success.
    pub max_attempts: Option<u64>,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Base sleep interval(s).
    pub sleep: SleepSchedule,
    /// Cap applied to every computed interval.
    pub sleep_max: Option<f64>,
    /// Jitter range coefficient: jitter lower bound is `sleep * jrc`.
    pub jrc: f64,
    /// Exponential base.
    pub base: f64,
    /// Error kinds that stop retrying immediately.
    pub stop_on: Vec<String>,
    /// If set, only these error kinds are retried.
    pub retry_on: Option<Vec<String>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_strategy: BackoffStrategy::Fixed,
            sleep: SleepSchedule::default(),
            sleep_max: None,
            jrc: 0.0,
            base: 2.0,
            stop_on: Vec::new(),
            retry_on: None,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u64) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Sets a fixed sleep interval in seconds.
    #[must_use]
    pub fn with_sleep(mut self, seconds: f64) -> Self {
        self.sleep = SleepSchedule::Interval(seconds);
        self
    }

    /// Sets the maximum sleep interval in seconds.
    #[must_use]
    pub fn with_sleep_max(mut self, seconds: f64) -> Self {
        self.sleep_max = Some(seconds);
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter range coefficient.
    #[must_use]
    pub fn with_jrc(mut self, jrc: f64) -> Self {
        self.jrc = jrc;
        self
    }

    /// Sets the error kinds that stop retrying.
    #[must_use]
    pub fn with_stop_on(mut self, kinds: Vec<String>) -> Self {
        self.stop_on = kinds;
        self
    }

    /// Restricts retries to these error kinds.
    #[must_use]
    pub fn with_retry_on(mut self, kinds: Vec<String>) -> Self {
        self.retry_on = Some(kinds);
        self
    }

    /// Calculates the delay before the attempt after `attempt`.
    #[must_use]
    pub fn calculate_delay(&self, attempt: u64) -> Duration {
        let n = i32::try_from(attempt).unwrap_or(i32::MAX);
        let sleep = match self.backoff_strategy {
            BackoffStrategy::Fixed | BackoffStrategy::Jitter => self.sleep.for_attempt(attempt),
            BackoffStrategy::Linear | BackoffStrategy::LinearJitter => {
                self.sleep.base() * f64::from(n)
            }
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialJitter => {
                self.sleep.base() * self.base.powi(n)
            }
        };
        let capped = match self.sleep_max {
            Some(max) if max > 0.0 => sleep.min(max),
            _ => sleep,
        };

        let jittered = if self.backoff_strategy.is_jittered() {
            let low = capped * self.jrc;
            if low < capped {
                rand::thread_rng().gen_range(low..=capped)
            } else {
                capped
            }
        } else {
            capped
        };

        seconds(jittered)
    }

    /// Decides whether a failed attempt is retried.
    #[must_use]
    pub fn should_retry(&self, error: &StepwiseError, attempt: u64) -> RetryDecision {
        if error.is_control_flow() {
            return RetryDecision::NotRetryable;
        }
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return RetryDecision::GiveUp;
        }
        let name = error.kind_name();
        if self.stop_on.iter().any(|kind| kind == name) {
            tracing::error!(error = %name, "Error in stopOn, raising and exiting retry");
            return RetryDecision::NotRetryable;
        }
        if let Some(retry_on) = &self.retry_on {
            if !retry_on.iter().any(|kind| kind == name) {
                tracing::error!(error = %name, "Error not in retryOn, raising and exiting retry");
                return RetryDecision::NotRetryable;
            }
        }
        RetryDecision::Retry(self.calculate_delay(attempt))
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more attempts, give up.
    GiveUp,
    /// Don't retry, the error is excluded.
    NotRetryable,
}

/// Converts seconds to a duration, treating negative or invalid input as zero.
pub(crate) fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

/// The `retry` decorator as written in the pipeline, resolved per execution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetryDecorator {
    /// Backoff strategy name.
    pub backoff: Option<Value>,
    /// Extra strategy arguments, e.g. `base`.
    pub backoff_args: Option<Value>,
    /// Jitter range coefficient.
    pub jrc: Option<Value>,
    /// Maximum attempts.
    pub max: Option<Value>,
    /// Error kinds to retry.
    pub retry_on: Option<Value>,
    /// Sleep seconds, or a list of them.
    pub sleep: Option<Value>,
    /// Sleep cap in seconds.
    pub sleep_max: Option<Value>,
    /// Error kinds to stop on.
    pub stop_on: Option<Value>,
}

impl RetryDecorator {
    /// Parses the decorator mapping.
    pub fn from_value(value: &Value) -> Result<Self, StepwiseError> {
        let Value::Map(map) = value else {
            return Err(StepwiseError::definition(
                "retry decorator must be a mapping",
            ));
        };
        let mut decorator = Self::default();
        for (key, value) in map {
            let slot = match key.as_str() {
                "backoff" => &mut decorator.backoff,
                "backoffArgs" => &mut decorator.backoff_args,
                "jrc" => &mut decorator.jrc,
                "max" => &mut decorator.max,
                "retryOn" => &mut decorator.retry_on,
                "sleep" => &mut decorator.sleep,
                "sleepMax" => &mut decorator.sleep_max,
                "stopOn" => &mut decorator.stop_on,
                other => {
                    return Err(StepwiseError::definition(format!(
                        "unknown retry decorator key '{other}'"
                    )))
                }
            };
            *slot = Some(value.clone());
        }
        Ok(decorator)
    }

    /// Formats the decorator against the context and resets `retryCounter`.
    pub fn resolve(&self, ctx: &mut Context) -> Result<RetryConfig, StepwiseError> {
        ctx.insert(RETRY_COUNTER_KEY, Value::Int(0));
        let mut config = RetryConfig::new();

        if let Some(max) = &self.max {
            let max = ctx.get_formatted_int(max, "retry.max")?;
            config.max_attempts = u64::try_from(max).ok().filter(|m| *m > 0);
        }
        if let Some(backoff) = &self.backoff {
            let name = ctx.get_formatted_value(backoff)?.to_string();
            config.backoff_strategy = name.parse()?;
        }
        if let Some(sleep) = &self.sleep {
            config.sleep = match ctx.get_formatted_value(sleep)? {
                Value::List(items) => {
                    let mut schedule = Vec::with_capacity(items.len());
                    for item in &items {
                        schedule.push(ctx.get_formatted_float(item, "retry.sleep")?);
                    }
                    SleepSchedule::Sequence(schedule)
                }
                other => SleepSchedule::Interval(ctx.get_formatted_float(&other, "retry.sleep")?),
            };
        }
        if let Some(sleep_max) = &self.sleep_max {
            config.sleep_max = Some(ctx.get_formatted_float(sleep_max, "retry.sleepMax")?);
        }
        if let Some(jrc) = &self.jrc {
            config.jrc = ctx.get_formatted_float(jrc, "retry.jrc")?;
        }
        if let Some(args) = &self.backoff_args {
            if let Value::Map(args) = ctx.get_formatted_value(args)? {
                if let Some(base) = args.get("base") {
                    config.base = ctx.get_formatted_float(base, "retry.backoffArgs.base")?;
                }
            }
        }
        if let Some(stop_on) = &self.stop_on {
            config.stop_on = kind_list(ctx, stop_on, "retry.stopOn")?;
        }
        if let Some(retry_on) = &self.retry_on {
            config.retry_on = Some(kind_list(ctx, retry_on, "retry.retryOn")?);
        }

        tracing::debug!(
            max = ?config.max_attempts,
            backoff = ?config.backoff_strategy,
            "Resolved retry decorator"
        );
        Ok(config)
    }
}

fn kind_list(ctx: &mut Context, value: &Value, label: &str) -> Result<Vec<String>, StepwiseError> {
    Ok(ctx
        .get_formatted_list(value, label)?
        .into_iter()
        .map(|kind| kind.to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fixed_delay_and_sequence() {
        let config = RetryConfig::new().with_sleep(1.5);
        assert_eq!(config.calculate_delay(1), Duration::from_millis(1500));
        assert_eq!(config.calculate_delay(5), Duration::from_millis(1500));

        let config = RetryConfig {
            sleep: SleepSchedule::Sequence(vec![0.1, 0.2]),
            ..RetryConfig::default()
        };
        assert_eq!(config.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(200));
    }

    #[test]
    fn test_linear_and_exponential() {
        let config = RetryConfig::new()
            .with_sleep(1.0)
            .with_backoff(BackoffStrategy::Linear);
        assert_eq!(config.calculate_delay(3), Duration::from_secs(3));

        let config = RetryConfig::new()
            .with_sleep(1.0)
            .with_backoff(BackoffStrategy::Exponential)
            .with_sleep_max(10.0);
        assert_eq!(config.calculate_delay(2), Duration::from_secs(4));
        assert_eq!(config.calculate_delay(4), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = RetryConfig::new()
            .with_sleep(2.0)
            .with_backoff(BackoffStrategy::Jitter)
            .with_jrc(0.5);
        for _ in 0..50 {
            let delay = config.calculate_delay(1);
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_should_retry_respects_max() {
        let config = RetryConfig::new().with_max_attempts(2);
        let err = StepwiseError::step_failed("ValueError", "x");
        assert_eq!(config.should_retry(&err, 1), RetryDecision::Retry(Duration::ZERO));
        assert_eq!(config.should_retry(&err, 2), RetryDecision::GiveUp);
    }

    #[test]
    fn test_retry_on_excludes_other_kinds() {
        let config = RetryConfig::new()
            .with_max_attempts(2)
            .with_retry_on(vec!["TimeoutError".to_string()]);
        let err = StepwiseError::step_failed("ValueError", "x");
        assert_eq!(config.should_retry(&err, 1), RetryDecision::NotRetryable);
        let err = StepwiseError::step_failed("TimeoutError", "x");
        assert!(matches!(config.should_retry(&err, 1), RetryDecision::Retry(_)));
    }

    #[test]
    fn test_stop_on_takes_precedence() {
        let config = RetryConfig::new()
            .with_stop_on(vec!["ValueError".to_string()])
            .with_retry_on(vec!["ValueError".to_string()]);
        let err = StepwiseError::step_failed("ValueError", "x");
        assert_eq!(config.should_retry(&err, 1), RetryDecision::NotRetryable);
    }

    #[test]
    fn test_control_flow_never_retried() {
        let config = RetryConfig::new();
        let err = StepwiseError::Control(crate::pipeline::ControlFlow::StopStepGroup);
        assert_eq!(config.should_retry(&err, 1), RetryDecision::NotRetryable);
    }

    #[test]
    fn test_decorator_parse_and_resolve() {
        let decorator = RetryDecorator::from_value(&Value::from(json!({
            "max": "{attempts}",
            "sleep": [0.1, "{s}"],
            "backoff": "fixed",
            "retryOn": ["TimeoutError"],
            "backoffArgs": {"base": 3}
        })))
        .unwrap();
        let mut ctx = Context::from_json(json!({"attempts": 3, "s": 0.5}));
        let config = decorator.resolve(&mut ctx).unwrap();
        assert_eq!(config.max_attempts, Some(3));
        assert_eq!(config.sleep, SleepSchedule::Sequence(vec![0.1, 0.5]));
        assert_eq!(config.retry_on, Some(vec!["TimeoutError".to_string()]));
        assert!((config.base - 3.0).abs() < f64::EPSILON);
        assert_eq!(ctx.get(RETRY_COUNTER_KEY), Some(&Value::Int(0)));
    }

    #[test]
    fn test_decorator_rejects_unknown_keys() {
        assert!(RetryDecorator::from_value(&Value::from(json!({"maxx": 1}))).is_err());
        assert!(RetryDecorator::from_value(&Value::from("x")).is_err());
    }

    #[test]
    fn test_unknown_backoff() {
        assert!("sideways".parse::<BackoffStrategy>().is_err());
        assert_eq!(
            "ExponentialJitter".parse::<BackoffStrategy>().unwrap(),
            BackoffStrategy::ExponentialJitter
        );
    }
}
