//! Mock collaborators for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::collaborators::Collaborator;
use crate::context::{Context, Map};
use crate::errors::StepwiseError;
use crate::invoker::PipelineInvoker;

/// Appends an entry to a journal on every call.
///
/// The entry is the label, or `label:value` when a recording key is set.
/// Several recorders can share one journal to observe execution order.
#[derive(Debug, Clone)]
pub struct RecordingCollaborator {
    label: String,
    key: Option<String>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl RecordingCollaborator {
    /// Creates a recorder with its own journal.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_journal(label, Arc::new(Mutex::new(Vec::new())))
    }

    /// Creates a recorder writing to `journal`.
    #[must_use]
    pub fn with_journal(label: impl Into<String>, journal: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            label: label.into(),
            key: None,
            journal,
        }
    }

    /// Also records the value of context key `key` on each call.
    #[must_use]
    pub fn recording_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// The journal this recorder writes to.
    #[must_use]
    pub fn shared_journal(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.journal)
    }

    /// Snapshot of the journal.
    #[must_use]
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    /// Number of entries this recorder wrote.
    #[must_use]
    pub fn calls(&self) -> usize {
        let prefix = format!("{}:", self.label);
        self.journal
            .lock()
            .iter()
            .filter(|entry| **entry == self.label || entry.starts_with(&prefix))
            .count()
    }
}

#[async_trait]
impl Collaborator for RecordingCollaborator {
    fn name(&self) -> &str {
        &self.label
    }

    async fn run(&self, ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        let entry = match &self.key {
            Some(key) => match ctx.get(key) {
                Some(value) => format!("{}:{value}", self.label),
                None => format!("{}:<missing>", self.label),
            },
            None => self.label.clone(),
        };
        self.journal.lock().push(entry);
        Ok(())
    }
}

/// Fails the first `times` calls with a classified error, then succeeds.
#[derive(Debug)]
pub struct FailingCollaborator {
    name: String,
    kind: String,
    times: Option<usize>,
    calls: Mutex<usize>,
}

impl FailingCollaborator {
    /// Fails the first `times` calls with error kind `kind`.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>, times: usize) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            times: Some(times),
            calls: Mutex::new(0),
        }
    }

    /// Fails every call.
    #[must_use]
    pub fn always(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            times: None,
            ..Self::new(name, kind, 0)
        }
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl Collaborator for FailingCollaborator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        let call = {
            let mut calls = self.calls.lock();
            *calls += 1;
            *calls
        };
        match self.times {
            Some(times) if call > times => Ok(()),
            _ => Err(StepwiseError::step_failed(
                self.kind.clone(),
                format!("{} failed on call {call}", self.name),
            )),
        }
    }
}

/// Snapshots the context data on every call.
#[derive(Debug, Default)]
pub struct ContextSnapshotter {
    name: String,
    snapshots: Mutex<Vec<Map>>,
}

impl ContextSnapshotter {
    /// Creates a snapshotter registered as `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snapshots: Mutex::new(Vec::new()),
        }
    }

    /// Every snapshot taken, oldest first.
    #[must_use]
    pub fn snapshots(&self) -> Vec<Map> {
        self.snapshots.lock().clone()
    }

    /// The most recent snapshot.
    #[must_use]
    pub fn last(&self) -> Option<Map> {
        self.snapshots.lock().last().cloned()
    }
}

#[async_trait]
impl Collaborator for ContextSnapshotter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut Context, _invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        self.snapshots.lock().push(ctx.data().clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Value;

    #[tokio::test]
    async fn test_recorders_share_journal() {
        let invoker = PipelineInvoker::new();
        let first = RecordingCollaborator::new("a");
        let second = RecordingCollaborator::with_journal("b", first.shared_journal()).recording_key("x");
        let mut ctx = Context::from_json(serde_json::json!({"x": 5}));

        first.run(&mut ctx, &invoker).await.unwrap();
        second.run(&mut ctx, &invoker).await.unwrap();
        first.run(&mut ctx, &invoker).await.unwrap();

        assert_eq!(first.journal(), vec!["a", "b:5", "a"]);
        assert_eq!(first.calls(), 2);
        assert_eq!(second.calls(), 1);
    }

    #[tokio::test]
    async fn test_failing_then_succeeding() {
        let invoker = PipelineInvoker::new();
        let failing = FailingCollaborator::new("f", "TimeoutError", 1);
        let mut ctx = Context::new();
        let err = failing.run(&mut ctx, &invoker).await.unwrap_err();
        assert_eq!(err.kind_name(), "TimeoutError");
        failing.run(&mut ctx, &invoker).await.unwrap();
        assert_eq!(failing.calls(), 2);
    }

    #[tokio::test]
    async fn test_snapshotter_records_context() {
        let invoker = PipelineInvoker::new();
        let snapshot = ContextSnapshotter::new("snapshot");
        let mut ctx = Context::from_json(serde_json::json!({"k": "v"}));
        snapshot.run(&mut ctx, &invoker).await.unwrap();
        ctx.insert("k", "changed");
        assert_eq!(snapshot.last().and_then(|m| m.get("k").cloned()), Some(Value::from("v")));
    }
}
