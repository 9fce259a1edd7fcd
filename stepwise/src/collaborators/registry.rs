//! Name-to-collaborator registry.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{builtin, Collaborator, FnCollaborator};
use crate::context::Context;
use crate::errors::StepwiseError;

/// Registry mapping step names to collaborators.
///
/// Collaborators are registered either globally or scoped to a pipeline
/// location. Resolution tries the invoking pipeline's location first, then
/// the global scope, so a pipeline and its collaborators can be relocated
/// together.
#[derive(Debug, Default)]
pub struct CollaboratorRegistry {
    global: RwLock<HashMap<String, Arc<dyn Collaborator>>>,
    scoped: RwLock<HashMap<(PathBuf, String), Arc<dyn Collaborator>>>,
}

impl CollaboratorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in control-flow and context
    /// collaborators.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        builtin::register_all(&registry);
        registry
    }

    /// Registers a collaborator under its own name.
    pub fn register(&self, collaborator: Arc<dyn Collaborator>) {
        let name = collaborator.name().to_string();
        self.register_as(name, collaborator);
    }

    /// Registers a collaborator under an explicit name.
    pub fn register_as(&self, name: impl Into<String>, collaborator: Arc<dyn Collaborator>) {
        let name = name.into();
        tracing::debug!(collaborator = %name, "Registering collaborator");
        self.global.write().insert(name, collaborator);
    }

    /// Registers a closure as a collaborator.
    pub fn register_fn<F>(&self, name: impl Into<String>, func: F)
    where
        F: Fn(&mut Context) -> Result<(), StepwiseError> + Send + Sync + 'static,
    {
        let name = name.into();
        self.register_as(name.clone(), Arc::new(FnCollaborator::new(name, func)));
    }

    /// Registers a collaborator visible only to pipelines loaded from
    /// `location`.
    pub fn register_scoped(
        &self,
        location: impl Into<PathBuf>,
        name: impl Into<String>,
        collaborator: Arc<dyn Collaborator>,
    ) {
        let key = (location.into(), name.into());
        tracing::debug!(
            collaborator = %key.1,
            location = %key.0.display(),
            "Registering scoped collaborator"
        );
        self.scoped.write().insert(key, collaborator);
    }

    /// Resolves a step name, preferring the scope of `location`.
    pub fn resolve(
        &self,
        name: &str,
        location: Option<&Path>,
    ) -> Result<Arc<dyn Collaborator>, StepwiseError> {
        if let Some(location) = location {
            let scoped = self
                .scoped
                .read()
                .get(&(location.to_path_buf(), name.to_string()))
                .cloned();
            if let Some(collaborator) = scoped {
                return Ok(collaborator);
            }
        }
        self.global
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StepwiseError::CollaboratorNotFound {
                name: name.to_string(),
            })
    }

    /// Returns true if `name` is registered globally.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.global.read().contains_key(name)
    }

    /// Globally registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.global.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Removes a global registration.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Collaborator>> {
        self.global.write().remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_name_is_typed_error() {
        let registry = CollaboratorRegistry::new();
        let err = registry.resolve("nope", None).unwrap_err();
        assert_eq!(err.kind_name(), "CollaboratorNotFoundError");
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_builtins_registered() {
        let registry = CollaboratorRegistry::with_builtins();
        for name in [
            "assert",
            "call",
            "contextmerge",
            "default",
            "exec",
            "jump",
            "pype",
            "set",
            "stop",
            "stoppipeline",
            "stopstepgroup",
        ] {
            assert!(registry.contains(name), "missing builtin {name}");
        }
    }

    #[test]
    fn test_scoped_resolution_prefers_location() {
        let registry = CollaboratorRegistry::new();
        registry.register_fn("step", |_| Ok(()));
        registry.register_scoped(
            "/pipes/a",
            "step",
            Arc::new(FnCollaborator::new("scoped", |_: &mut Context| Ok(()))),
        );

        let scoped = registry.resolve("step", Some(Path::new("/pipes/a"))).unwrap();
        assert_eq!(scoped.name(), "scoped");

        let fallback = registry.resolve("step", Some(Path::new("/pipes/b"))).unwrap();
        assert_eq!(fallback.name(), "step");

        let global = registry.resolve("step", None).unwrap();
        assert_eq!(global.name(), "step");
    }

    #[test]
    fn test_unregister() {
        let registry = CollaboratorRegistry::new();
        registry.register_fn("a", |_| Ok(()));
        registry.register_fn("b", |_| Ok(()));
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.unregister("a").is_some());
        assert!(!registry.contains("a"));
    }
}
