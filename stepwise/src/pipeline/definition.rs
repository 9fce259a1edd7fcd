//! Parsed pipeline definitions.
//!
//! A pipeline source is a mapping from step-group name to a list of steps,
//! plus an optional `context_parser` entry. Definitions are immutable once
//! parsed and are shared read-only through `Arc`.

use indexmap::IndexMap;
use std::path::PathBuf;

use super::step::Step;
use crate::context::{Map, Value};
use crate::errors::StepwiseError;

/// Top-level key naming the context parser.
pub const CONTEXT_PARSER_KEY: &str = "context_parser";

/// Where a definition came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineInfo {
    /// Pipeline name as requested.
    pub name: String,
    /// Name of the loader that produced it.
    pub loader: String,
    /// Directory (or other identity) it was loaded from.
    pub location: Option<PathBuf>,
    /// Whether child pipelines resolve relative to `location`.
    pub is_parent_cascading: bool,
    /// Whether child pipelines default to the same loader.
    pub is_loader_cascading: bool,
}

impl PipelineInfo {
    /// Creates info for a named pipeline.
    pub fn new(name: impl Into<String>, loader: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            loader: loader.into(),
            ..Self::default()
        }
    }

    /// Sets the location.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Sets the cascade flags.
    #[must_use]
    pub fn with_cascading(mut self, parent: bool, loader: bool) -> Self {
        self.is_parent_cascading = parent;
        self.is_loader_cascading = loader;
        self
    }
}

/// A named, ordered sequence of steps.
#[derive(Debug, Clone)]
pub struct StepGroup {
    name: String,
    steps: Vec<Step>,
}

impl StepGroup {
    /// Creates a group.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// The group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The steps, in declaration order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the group has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A parsed pipeline.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    groups: IndexMap<String, StepGroup>,
    context_parser: Option<String>,
    info: PipelineInfo,
}

impl PipelineDefinition {
    /// Parses YAML pipeline source.
    pub fn from_yaml_str(source: &str, info: PipelineInfo) -> Result<Self, StepwiseError> {
        let yaml: serde_yaml::Value = serde_yaml::from_str(source)?;
        Self::from_value(&Value::from_yaml(yaml), info)
    }

    /// Parses an already decoded pipeline body.
    pub fn from_value(value: &Value, info: PipelineInfo) -> Result<Self, StepwiseError> {
        let Value::Map(body) = value else {
            return Err(StepwiseError::definition(format!(
                "pipeline '{}' must be a mapping of step-group names to steps, found {}",
                info.name,
                value.type_name()
            )));
        };

        let mut groups = IndexMap::with_capacity(body.len());
        let mut context_parser = None;
        for (name, entry) in body {
            if name == CONTEXT_PARSER_KEY {
                context_parser = match entry {
                    Value::Null => None,
                    Value::String(parser) => Some(parser.clone()),
                    other => {
                        return Err(StepwiseError::definition(format!(
                            "{CONTEXT_PARSER_KEY} must be a name, found {}",
                            other.type_name()
                        )))
                    }
                };
                continue;
            }
            let steps = match entry {
                Value::Null => Vec::new(),
                Value::List(items) => items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| Step::from_value(item, name, index))
                    .collect::<Result<Vec<_>, _>>()?,
                other => {
                    return Err(StepwiseError::definition(format!(
                        "step-group '{name}' must be a list of steps, found {}",
                        other.type_name()
                    )))
                }
            };
            groups.insert(name.clone(), StepGroup::new(name.clone(), steps));
        }

        tracing::debug!(
            pipeline = %info.name,
            groups = groups.len(),
            "Parsed pipeline definition"
        );
        Ok(Self {
            groups,
            context_parser,
            info,
        })
    }

    /// Looks up a step-group.
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&StepGroup> {
        self.groups.get(name)
    }

    /// Group names in source order.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// The context parser named by the pipeline, if any.
    #[must_use]
    pub fn context_parser(&self) -> Option<&str> {
        self.context_parser.as_deref()
    }

    /// Where the pipeline came from.
    #[must_use]
    pub fn info(&self) -> &PipelineInfo {
        &self.info
    }
}

/// Fails on the first key of `map` not in `allowed`.
pub(crate) fn reject_unknown(map: &Map, allowed: &[&str], what: &str) -> Result<(), StepwiseError> {
    match map.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(StepwiseError::definition(format!("unknown {what} key '{key}'"))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r"
context_parser: keyvaluepairs
steps:
  - a.step
  - name: b.step
    in:
      x: 1
on_success:
on_failure:
  - handle
";

    #[test]
    fn test_parse_groups_in_order() {
        let definition =
            PipelineDefinition::from_yaml_str(SOURCE, PipelineInfo::new("main", "test")).unwrap();
        assert_eq!(
            definition.group_names().collect::<Vec<_>>(),
            vec!["steps", "on_success", "on_failure"]
        );
        assert_eq!(definition.context_parser(), Some("keyvaluepairs"));

        let steps = definition.group("steps").unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps.steps()[1].name, "b.step");
        assert_eq!(steps.steps()[1].location().index, 1);
        assert!(definition.group("on_success").unwrap().is_empty());
        assert!(definition.group("missing").is_none());
    }

    #[test]
    fn test_group_must_be_list() {
        let err = PipelineDefinition::from_yaml_str("steps: nope", PipelineInfo::default())
            .unwrap_err();
        assert_eq!(err.kind_name(), "PipelineDefinitionError");
    }

    #[test]
    fn test_body_must_be_mapping() {
        let err =
            PipelineDefinition::from_yaml_str("- a\n- b", PipelineInfo::default()).unwrap_err();
        assert_eq!(err.kind_name(), "PipelineDefinitionError");
    }

    #[test]
    fn test_invalid_yaml() {
        let err = PipelineDefinition::from_yaml_str("steps: [", PipelineInfo::default())
            .unwrap_err();
        assert_eq!(err.kind_name(), "YamlError");
    }
}
