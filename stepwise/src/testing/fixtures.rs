//! Fixtures for pipeline tests.

use std::sync::Arc;

use crate::collaborators::{Collaborator, CollaboratorRegistry};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::errors::StepwiseError;
use crate::invoker::{InMemoryLoader, PipelineInvoker};

/// A registry holding the built-ins plus `collaborators`.
#[must_use]
pub fn registry_with(collaborators: Vec<Arc<dyn Collaborator>>) -> Arc<CollaboratorRegistry> {
    let registry = CollaboratorRegistry::with_builtins();
    for collaborator in collaborators {
        registry.register(collaborator);
    }
    Arc::new(registry)
}

/// An invoker whose default loader is an in-memory loader holding
/// `pipelines` as `(name, yaml)` pairs.
pub fn invoker_with_pipelines(pipelines: &[(&str, &str)]) -> Result<PipelineInvoker, StepwiseError> {
    let loader = InMemoryLoader::default();
    for (name, source) in pipelines {
        loader.add_pipeline(*name, source)?;
    }
    let config = EngineConfig::new().with_default_loader(InMemoryLoader::DEFAULT_NAME);
    Ok(PipelineInvoker::with_config(config).with_loader(Arc::new(loader)))
}

/// A context seeded from a JSON object.
#[must_use]
pub fn context_from_json(value: serde_json::Value) -> Context {
    Context::from_json(value)
}
