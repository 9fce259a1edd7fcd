//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::StepwiseError;

/// Construction-time settings for a [`PipelineInvoker`](crate::invoker::PipelineInvoker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// The entry step-group.
    #[serde(default = "default_group")]
    pub default_group: String,
    /// Runs after the entry group succeeds.
    #[serde(default = "default_success_group")]
    pub default_success_group: String,
    /// Runs after the entry group fails.
    #[serde(default = "default_failure_group")]
    pub default_failure_group: String,
    /// Root for relative pipeline lookups.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Subdirectory of `working_dir` searched last.
    #[serde(default = "default_pipelines_subdir")]
    pub pipelines_subdir: String,
    /// File extension of pipeline sources, without the dot.
    #[serde(default = "default_pipeline_extension")]
    pub pipeline_extension: String,
    /// Loader used when neither the request nor the parent names one.
    #[serde(default = "default_loader")]
    pub default_loader: String,
}

fn default_group() -> String {
    "steps".to_string()
}

fn default_success_group() -> String {
    "on_success".to_string()
}

fn default_failure_group() -> String {
    "on_failure".to_string()
}

fn default_working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn default_pipelines_subdir() -> String {
    "pipelines".to_string()
}

fn default_pipeline_extension() -> String {
    "yaml".to_string()
}

fn default_loader() -> String {
    "file".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_group: default_group(),
            default_success_group: default_success_group(),
            default_failure_group: default_failure_group(),
            working_dir: default_working_dir(),
            pipelines_subdir: default_pipelines_subdir(),
            pipeline_extension: default_pipeline_extension(),
            default_loader: default_loader(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a YAML configuration; missing fields take their defaults.
    pub fn from_yaml_str(source: &str) -> Result<Self, StepwiseError> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Sets the default loader name.
    #[must_use]
    pub fn with_default_loader(mut self, loader: impl Into<String>) -> Self {
        self.default_loader = loader.into();
        self
    }

    /// Sets the pipelines subdirectory.
    #[must_use]
    pub fn with_pipelines_subdir(mut self, subdir: impl Into<String>) -> Self {
        self.pipelines_subdir = subdir.into();
        self
    }

    /// Returns true for the entry, success and failure group names. Those
    /// groups are optional in a pipeline; any other missing group is an
    /// error.
    #[must_use]
    pub fn is_default_group(&self, name: &str) -> bool {
        name == self.default_group
            || name == self.default_success_group
            || name == self.default_failure_group
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_group, "steps");
        assert_eq!(config.default_success_group, "on_success");
        assert_eq!(config.default_failure_group, "on_failure");
        assert_eq!(config.pipelines_subdir, "pipelines");
        assert_eq!(config.pipeline_extension, "yaml");
        assert_eq!(config.default_loader, "file");
        assert!(config.is_default_group("on_failure"));
        assert!(!config.is_default_group("cleanup"));
    }

    #[test]
    fn test_from_yaml_fills_missing_fields() {
        let config = EngineConfig::from_yaml_str("working_dir: /srv/pipes\ndefault_loader: mem\n")
            .unwrap();
        assert_eq!(config.working_dir, PathBuf::from("/srv/pipes"));
        assert_eq!(config.default_loader, "mem");
        assert_eq!(config.default_group, "steps");
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::new()
            .with_working_dir("/w")
            .with_pipelines_subdir("flows")
            .with_default_loader("memory");
        assert_eq!(config.working_dir, PathBuf::from("/w"));
        assert_eq!(config.pipelines_subdir, "flows");
        assert_eq!(config.default_loader, "memory");
    }
}
