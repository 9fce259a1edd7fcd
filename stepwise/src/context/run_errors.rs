//! Structured records of step failures, kept even when swallowed.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Map, Value};
use crate::errors::StepwiseError;

/// Where a failing step lives in its pipeline source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepLocation {
    /// Pipeline name, when known.
    pub pipeline: Option<String>,
    /// Step-group name.
    pub group: String,
    /// Zero-based position within the group.
    pub index: usize,
}

impl StepLocation {
    /// Creates a location within a group.
    pub fn new(group: impl Into<String>, index: usize) -> Self {
        Self {
            pipeline: None,
            group: group.into(),
            index,
        }
    }

    /// Sets the pipeline name.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }

    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "pipeline".to_string(),
            self.pipeline.clone().map_or(Value::Null, Value::String),
        );
        map.insert("group".to_string(), Value::String(self.group.clone()));
        map.insert(
            "index".to_string(),
            Value::Int(i64::try_from(self.index).unwrap_or(i64::MAX)),
        );
        Value::Map(map)
    }
}

/// One failure, appended to `runErrors` before the error unwinds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunErrorRecord {
    /// Classification name of the error.
    pub name: String,
    /// Human readable description.
    pub description: String,
    /// Formatted `onError` payload, if the step had one.
    pub custom_error: Option<Value>,
    /// Source coordinates of the failing step.
    pub location: Option<StepLocation>,
    /// The failing step's collaborator name.
    pub step: Option<String>,
    /// Debug rendering of the underlying error.
    pub exception: String,
    /// Whether the step swallowed the error.
    pub swallowed: bool,
    /// When the error was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl RunErrorRecord {
    /// Builds a record from an error. Recorded markers are looked through.
    #[must_use]
    pub fn from_error(error: &StepwiseError) -> Self {
        let root = error.root();
        Self {
            name: root.kind_name().to_string(),
            description: root.to_string(),
            custom_error: None,
            location: None,
            step: None,
            exception: format!("{root:?}"),
            swallowed: false,
            occurred_at: Utc::now(),
        }
    }

    /// Attaches the `onError` payload.
    #[must_use]
    pub fn with_custom_error(mut self, payload: Value) -> Self {
        self.custom_error = Some(payload);
        self
    }

    /// Attaches the step location.
    #[must_use]
    pub fn with_location(mut self, location: StepLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Attaches the collaborator name.
    #[must_use]
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Sets the swallowed flag.
    #[must_use]
    pub fn with_swallowed(mut self, swallowed: bool) -> Self {
        self.swallowed = swallowed;
        self
    }

    /// The pipeline-visible form stored under `runErrors`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("name".to_string(), Value::String(self.name.clone()));
        map.insert("description".to_string(), Value::String(self.description.clone()));
        map.insert(
            "customError".to_string(),
            self.custom_error.clone().unwrap_or_default(),
        );
        map.insert(
            "location".to_string(),
            self.location.as_ref().map_or(Value::Null, StepLocation::to_value),
        );
        map.insert(
            "step".to_string(),
            self.step.clone().map_or(Value::Null, Value::String),
        );
        map.insert("exception".to_string(), Value::String(self.exception.clone()));
        map.insert("swallowed".to_string(), Value::Bool(self.swallowed));
        Value::Map(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_error_looks_through_handled() {
        let err = StepwiseError::step_failed("ValueError", "bad input").into_handled();
        let record = RunErrorRecord::from_error(&err)
            .with_step("my.step")
            .with_location(StepLocation::new("steps", 2).with_pipeline("main"))
            .with_swallowed(true);
        assert_eq!(record.name, "ValueError");
        assert_eq!(record.description, "ValueError: bad input");
        assert!(record.exception.contains("StepExecution"));

        let value = record.to_value();
        let map = value.as_map().unwrap();
        assert_eq!(map["swallowed"], Value::Bool(true));
        assert_eq!(map["step"], Value::from("my.step"));
        assert_eq!(map["location"].as_map().unwrap()["index"], Value::Int(2));
        assert_eq!(map["customError"], Value::Null);
    }

    #[test]
    fn test_serializes_camel_case() {
        let record = RunErrorRecord::from_error(&StepwiseError::Assertion("x".to_string()))
            .with_custom_error(Value::from("payload"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["customError"], serde_json::json!("payload"));
        assert!(json.get("occurredAt").is_some());
    }
}
