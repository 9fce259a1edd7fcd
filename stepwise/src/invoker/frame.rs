//! The pipeline call-stack.
//!
//! Each running pipeline gets a [`PipelineCallFrame`] linked to the frame
//! that invoked it. Contexts hold a read-only `Arc` to the top frame; the
//! invoker pushes a frame on entry and restores the previous one on exit.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// One entry in the pipeline call-stack.
#[derive(Debug, Clone)]
pub struct PipelineCallFrame {
    /// Pipeline name as requested.
    pub name: String,
    /// Name of the loader that produced the pipeline.
    pub loader: String,
    /// Directory (or other identity) the pipeline was loaded from.
    pub location: Option<PathBuf>,
    /// Whether children should resolve relative to `location`.
    pub is_parent_cascading: bool,
    /// Whether children inherit `loader` by default.
    pub is_loader_cascading: bool,
    /// Whether this frame shares its parent's context.
    pub shares_parent_context: bool,
    /// Identifier of this pipeline run.
    pub run_id: Uuid,
    /// When the frame was pushed.
    pub started_at: DateTime<Utc>,
    parent: Option<Arc<PipelineCallFrame>>,
    depth: usize,
}

impl PipelineCallFrame {
    /// Creates a root frame.
    pub fn root(name: impl Into<String>, loader: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            loader: loader.into(),
            location: None,
            is_parent_cascading: false,
            is_loader_cascading: false,
            shares_parent_context: false,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            parent: None,
            depth: 0,
        }
    }

    /// Creates a frame on top of `parent`.
    pub fn child_of(
        parent: Option<Arc<Self>>,
        name: impl Into<String>,
        loader: impl Into<String>,
        shares_parent_context: bool,
    ) -> Self {
        let depth = parent.as_ref().map_or(0, |p| p.depth + 1);
        Self {
            shares_parent_context: shares_parent_context && parent.is_some(),
            parent,
            depth,
            ..Self::root(name, loader)
        }
    }

    /// Sets where the pipeline was loaded from.
    #[must_use]
    pub fn with_location(mut self, location: Option<PathBuf>) -> Self {
        self.location = location;
        self
    }

    /// Sets the loader's cascade flags.
    #[must_use]
    pub fn with_cascading(mut self, parent: bool, loader: bool) -> Self {
        self.is_parent_cascading = parent;
        self.is_loader_cascading = loader;
        self
    }

    /// The invoking frame, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Self>> {
        self.parent.as_ref()
    }

    /// Number of frames below this one.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns true if nothing invoked this pipeline.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Location children should resolve against, if this frame cascades.
    #[must_use]
    pub fn child_lookup_location(&self) -> Option<&Path> {
        if self.is_parent_cascading {
            self.location.as_deref()
        } else {
            None
        }
    }

    /// Iterates from this frame down to the root.
    pub fn ancestors(&self) -> impl Iterator<Item = &Self> {
        std::iter::successors(Some(self), |frame| frame.parent.as_deref())
    }

    /// Pipeline names from the root up to this frame.
    #[must_use]
    pub fn stack_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ancestors().map(|f| f.name.clone()).collect();
        names.reverse();
        names
    }
}
