//! Testing utilities for stepwise pipelines.
//!
//! This module provides:
//! - Recording, failing and probing collaborators
//! - Registry, invoker and context fixtures

mod fixtures;
mod mocks;

pub use fixtures::{context_from_json, invoker_with_pipelines, registry_with};
pub use mocks::{ContextSnapshotter, FailingCollaborator, RecordingCollaborator};
