//! Pipeline loaders.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::errors::StepwiseError;
use crate::pipeline::{PipelineDefinition, PipelineInfo};

/// Resolves pipeline names to parsed definitions.
///
/// `parent` is the invoking pipeline's location, passed only when that
/// pipeline's loader cascades parent-relative lookups. Definitions are
/// immutable and may be shared across concurrent runs.
#[cfg_attr(test, mockall::automock)]
pub trait Loader: Send + Sync {
    /// The name the loader is registered under.
    fn name(&self) -> &str;

    /// Loads (or returns the cached) definition of `name`.
    fn get_pipeline<'a>(
        &self,
        name: &str,
        parent: Option<&'a Path>,
    ) -> Result<Arc<PipelineDefinition>, StepwiseError>;
}

/// Loader over pipelines registered in memory.
///
/// Sources are parsed once on registration. Children default to the same
/// loader; there is no parent location to cascade.
#[derive(Debug)]
pub struct InMemoryLoader {
    name: String,
    pipelines: RwLock<HashMap<String, Arc<PipelineDefinition>>>,
}

impl InMemoryLoader {
    /// Name used by [`InMemoryLoader::default`].
    pub const DEFAULT_NAME: &'static str = "memory";

    /// Creates an empty loader.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipelines: RwLock::new(HashMap::new()),
        }
    }

    /// Registers YAML source under `name`, replacing any earlier pipeline.
    pub fn add_pipeline(&self, name: impl Into<String>, source: &str) -> Result<(), StepwiseError> {
        let name = name.into();
        let info = PipelineInfo::new(name.clone(), self.name.clone()).with_cascading(false, true);
        let definition = PipelineDefinition::from_yaml_str(source, info)?;
        tracing::debug!(loader = %self.name, pipeline = %name, "Registered in-memory pipeline");
        self.pipelines.write().insert(name, Arc::new(definition));
        Ok(())
    }

    /// Builder form of [`InMemoryLoader::add_pipeline`].
    pub fn with_pipeline(self, name: impl Into<String>, source: &str) -> Result<Self, StepwiseError> {
        self.add_pipeline(name, source)?;
        Ok(self)
    }

    /// Registered pipeline names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for InMemoryLoader {
    fn default() -> Self {
        Self::new(Self::DEFAULT_NAME)
    }
}

impl Loader for InMemoryLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_pipeline(
        &self,
        name: &str,
        _parent: Option<&Path>,
    ) -> Result<Arc<PipelineDefinition>, StepwiseError> {
        self.pipelines
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StepwiseError::PipelineNotFound {
                name: name.to_string(),
                searched: vec![format!("{}:{name}", self.name)],
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_round_trip() {
        let loader = InMemoryLoader::default()
            .with_pipeline("main", "steps:\n  - a\n")
            .unwrap();
        let definition = loader.get_pipeline("main", None).unwrap();
        assert_eq!(definition.info().loader, "memory");
        assert!(definition.info().is_loader_cascading);
        assert!(!definition.info().is_parent_cascading);
        assert_eq!(definition.group("steps").map(|g| g.len()), Some(1));
    }

    #[test]
    fn test_in_memory_shares_parsed_definition() {
        let loader = InMemoryLoader::new("mem").with_pipeline("p", "steps: []").unwrap();
        let first = loader.get_pipeline("p", None).unwrap();
        let second = loader.get_pipeline("p", None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_in_memory_not_found() {
        let loader = InMemoryLoader::new("mem");
        let err = loader.get_pipeline("missing", None).unwrap_err();
        assert_eq!(err.kind_name(), "PipelineNotFoundError");
        assert!(err.to_string().contains("mem:missing"));
    }

    #[test]
    fn test_in_memory_rejects_bad_source() {
        let loader = InMemoryLoader::new("mem");
        assert!(loader.add_pipeline("bad", "steps: 3").is_err());
        assert!(loader.names().is_empty());
    }
}
