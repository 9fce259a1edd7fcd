//! Loads pipelines from YAML files on disk.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::loader::Loader;
use crate::config::EngineConfig;
use crate::errors::StepwiseError;
use crate::pipeline::{PipelineDefinition, PipelineInfo};

/// File-system loader with a parse cache keyed by resolved path.
///
/// `<name>.<ext>` is looked up, in order:
/// 1. as an absolute path;
/// 2. in the invoking pipeline's directory, when that differs from the
///    working directory;
/// 3. in the working directory;
/// 4. in `<working dir>/<pipelines subdir>`.
#[derive(Debug)]
pub struct FileLoader {
    name: String,
    working_dir: PathBuf,
    pipelines_subdir: String,
    extension: String,
    cache: DashMap<PathBuf, Arc<PipelineDefinition>>,
}

impl FileLoader {
    /// Name the loader registers under.
    pub const NAME: &'static str = "file";

    /// Creates a loader rooted at `working_dir`.
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: Self::NAME.to_string(),
            working_dir: working_dir.into(),
            pipelines_subdir: "pipelines".to_string(),
            extension: "yaml".to_string(),
            cache: DashMap::new(),
        }
    }

    /// Creates a loader from engine settings.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            pipelines_subdir: config.pipelines_subdir.clone(),
            extension: config.pipeline_extension.clone(),
            ..Self::new(config.working_dir.clone())
        }
    }

    /// Number of cached definitions.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Drops every cached definition.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn candidates(&self, name: &str, parent: Option<&Path>) -> Vec<PathBuf> {
        let file = PathBuf::from(format!("{name}.{}", self.extension));
        if file.is_absolute() {
            return vec![file];
        }
        let mut candidates = Vec::with_capacity(3);
        if let Some(parent) = parent.filter(|p| *p != self.working_dir) {
            candidates.push(parent.join(&file));
        }
        candidates.push(self.working_dir.join(&file));
        candidates.push(self.working_dir.join(&self.pipelines_subdir).join(&file));
        candidates
    }

    fn load(&self, name: &str, path: PathBuf) -> Result<Arc<PipelineDefinition>, StepwiseError> {
        if let Some(cached) = self.cache.get(&path) {
            tracing::debug!(pipeline = %name, path = %path.display(), "pipeline cache hit");
            return Ok(Arc::clone(cached.value()));
        }

        tracing::debug!(pipeline = %name, path = %path.display(), "loading pipeline from file");
        let source = std::fs::read_to_string(&path)?;
        let mut info = PipelineInfo::new(name, self.name.clone()).with_cascading(true, true);
        info.location = path.parent().map(Path::to_path_buf);
        let definition = Arc::new(PipelineDefinition::from_yaml_str(&source, info)?);
        Ok(Arc::clone(self.cache.entry(path).or_insert(definition).value()))
    }
}

impl Loader for FileLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_pipeline(
        &self,
        name: &str,
        parent: Option<&Path>,
    ) -> Result<Arc<PipelineDefinition>, StepwiseError> {
        let candidates = self.candidates(name, parent);
        match candidates.iter().find(|candidate| candidate.is_file()) {
            Some(found) => self.load(name, found.clone()),
            None => Err(StepwiseError::PipelineNotFound {
                name: name.to_string(),
                searched: candidates
                    .iter()
                    .map(|candidate| candidate.display().to_string())
                    .collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, relative: &str, source: &str) {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, source).unwrap();
    }

    #[test]
    fn test_search_order() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "pipelines/p.yaml", "steps: [from_subdir]");
        let loader = FileLoader::new(dir.path());
        let definition = loader.get_pipeline("p", None).unwrap();
        assert_eq!(definition.group("steps").unwrap().steps()[0].name, "from_subdir");
        assert_eq!(
            definition.info().location.as_deref(),
            Some(dir.path().join("pipelines").as_path())
        );

        write(dir.path(), "p.yaml", "steps: [from_root]");
        loader.clear_cache();
        let definition = loader.get_pipeline("p", None).unwrap();
        assert_eq!(definition.group("steps").unwrap().steps()[0].name, "from_root");
    }

    #[test]
    fn test_parent_directory_wins() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "child.yaml", "steps: [root_child]");
        write(dir.path(), "nested/child.yaml", "steps: [nested_child]");
        let loader = FileLoader::new(dir.path());

        let nested = dir.path().join("nested");
        let definition = loader.get_pipeline("child", Some(&nested)).unwrap();
        assert_eq!(definition.group("steps").unwrap().steps()[0].name, "nested_child");

        let definition = loader.get_pipeline("child", Some(dir.path())).unwrap();
        assert_eq!(definition.group("steps").unwrap().steps()[0].name, "root_child");
    }

    #[test]
    fn test_absolute_name() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "elsewhere/abs.yaml", "steps: [abs]");
        let loader = FileLoader::new("/nonexistent");
        let name = dir.path().join("elsewhere/abs");
        let definition = loader.get_pipeline(&name.display().to_string(), None).unwrap();
        assert_eq!(definition.group("steps").unwrap().steps()[0].name, "abs");
    }

    #[test]
    fn test_not_found_lists_every_location() {
        let dir = TempDir::new().unwrap();
        let loader = FileLoader::new(dir.path());
        let parent = dir.path().join("sub");
        let err = loader.get_pipeline("ghost", Some(&parent)).unwrap_err();
        match err {
            StepwiseError::PipelineNotFound { searched, .. } => {
                assert_eq!(searched.len(), 3);
                assert!(searched[0].contains("sub"));
                assert!(searched[2].contains("pipelines"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cache_returns_shared_definition() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "p.yaml", "steps: [a]");
        let loader = FileLoader::new(dir.path());
        let first = loader.get_pipeline("p", None).unwrap();
        fs::remove_file(dir.path().join("p.yaml")).unwrap();
        write(dir.path(), "pipelines/p.yaml", "steps: [b]");
        let second = loader.get_pipeline("p", None).unwrap();
        assert_eq!(second.group("steps").unwrap().steps()[0].name, "b");

        let third = loader.get_pipeline("p", None).unwrap();
        assert!(Arc::ptr_eq(&second, &third));
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(loader.cached(), 2);
    }
}
