//! The pipeline invoker: loads pipelines, maintains the call-stack and runs
//! step-groups against a context.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::file_loader::FileLoader;
use super::frame::PipelineCallFrame;
use super::loader::Loader;
use super::parser::{ContextParser, KeyValuePairsParser};
use crate::collaborators::CollaboratorRegistry;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::errors::StepwiseError;
use crate::events::{EventSink, NoOpEventSink};
use crate::expressions::{ExpressionEvaluator, RhaiEvaluator};
use crate::pipeline::runner::StepsRunner;
use crate::pipeline::{ControlFlow, PipelineDefinition};

/// What to run: a pipeline name plus group selection and parser input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRequest {
    /// Pipeline name, resolved by the selected loader.
    pub name: String,
    /// Explicit loader. Falls back to the parent's cascading loader, then to
    /// the configured default.
    pub loader: Option<String>,
    /// Step-groups to run. `None` means the default group with the default
    /// handlers.
    pub groups: Option<Vec<String>>,
    /// Group run after `groups` succeed.
    pub success_group: Option<String>,
    /// Group run after `groups` fail.
    pub failure_group: Option<String>,
    /// Raw arguments for the pipeline's context parser.
    pub context_args: Option<Vec<String>>,
    /// Whether the context parser runs at all.
    pub parse_input: bool,
}

impl PipelineRequest {
    /// Requests the default groups of `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            loader: None,
            groups: None,
            success_group: None,
            failure_group: None,
            context_args: None,
            parse_input: true,
        }
    }

    /// Sets the loader.
    #[must_use]
    pub fn with_loader(mut self, loader: Option<String>) -> Self {
        self.loader = loader;
        self
    }

    /// Sets the step-groups.
    #[must_use]
    pub fn with_groups(mut self, groups: Option<Vec<String>>) -> Self {
        self.groups = groups;
        self
    }

    /// Sets the success group.
    #[must_use]
    pub fn with_success_group(mut self, group: Option<String>) -> Self {
        self.success_group = group;
        self
    }

    /// Sets the failure group.
    #[must_use]
    pub fn with_failure_group(mut self, group: Option<String>) -> Self {
        self.failure_group = group;
        self
    }

    /// Sets the context parser arguments.
    #[must_use]
    pub fn with_context_args(mut self, args: Option<Vec<String>>) -> Self {
        self.context_args = args;
        self
    }

    /// Enables or bypasses the context parser.
    #[must_use]
    pub fn with_parse_input(mut self, parse_input: bool) -> Self {
        self.parse_input = parse_input;
        self
    }

    /// Groups plus success and failure handlers. Without explicit groups,
    /// the configured defaults fill any handler left unset. With explicit
    /// groups, only the named handlers run.
    fn resolve_groups(&self, config: &EngineConfig) -> (Vec<String>, Option<String>, Option<String>) {
        match &self.groups {
            Some(groups) => (
                groups.clone(),
                self.success_group.clone(),
                self.failure_group.clone(),
            ),
            None => (
                vec![config.default_group.clone()],
                Some(
                    self.success_group
                        .clone()
                        .unwrap_or_else(|| config.default_success_group.clone()),
                ),
                Some(
                    self.failure_group
                        .clone()
                        .unwrap_or_else(|| config.default_failure_group.clone()),
                ),
            ),
        }
    }
}

/// Loads and runs pipelines.
///
/// Owns the collaborator registry, the loaders, the context parsers and the
/// event sink. One invoker can drive any number of independent runs, each on
/// its own [`Context`].
pub struct PipelineInvoker {
    config: EngineConfig,
    registry: Arc<CollaboratorRegistry>,
    loaders: HashMap<String, Arc<dyn Loader>>,
    parsers: HashMap<String, Arc<dyn ContextParser>>,
    event_sink: Arc<dyn EventSink>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl fmt::Debug for PipelineInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut loaders: Vec<&String> = self.loaders.keys().collect();
        loaders.sort();
        let mut parsers: Vec<&String> = self.parsers.keys().collect();
        parsers.sort();
        f.debug_struct("PipelineInvoker")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("loaders", &loaders)
            .field("parsers", &parsers)
            .field("evaluator", &self.evaluator)
            .finish_non_exhaustive()
    }
}

impl Default for PipelineInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineInvoker {
    /// Creates an invoker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Creates an invoker with the built-in collaborators, the file loader
    /// and the `keyvaluepairs` parser.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        let file_loader: Arc<dyn Loader> = Arc::new(FileLoader::from_config(&config));
        let keyvaluepairs: Arc<dyn ContextParser> = Arc::new(KeyValuePairsParser);
        Self {
            loaders: HashMap::from([(file_loader.name().to_string(), file_loader)]),
            parsers: HashMap::from([(keyvaluepairs.name().to_string(), keyvaluepairs)]),
            registry: Arc::new(CollaboratorRegistry::with_builtins()),
            event_sink: Arc::new(NoOpEventSink),
            evaluator: Arc::new(RhaiEvaluator::new()),
            config,
        }
    }

    /// Replaces the collaborator registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<CollaboratorRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Adds a loader under its own name.
    #[must_use]
    pub fn with_loader(self, loader: Arc<dyn Loader>) -> Self {
        let name = loader.name().to_string();
        self.with_named_loader(name, loader)
    }

    /// Adds a loader under `name`.
    #[must_use]
    pub fn with_named_loader(mut self, name: impl Into<String>, loader: Arc<dyn Loader>) -> Self {
        self.loaders.insert(name.into(), loader);
        self
    }

    /// Adds a context parser under its own name.
    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn ContextParser>) -> Self {
        self.parsers.insert(parser.name().to_string(), parser);
        self
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Replaces the evaluator given to contexts the invoker creates.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Engine settings.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Collaborator registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<CollaboratorRegistry> {
        &self.registry
    }

    /// Lifecycle event sink.
    #[must_use]
    pub fn event_sink(&self) -> &Arc<dyn EventSink> {
        &self.event_sink
    }

    /// An empty context wired to this invoker's evaluator.
    #[must_use]
    pub fn new_context(&self) -> Context {
        Context::new().with_evaluator(Arc::clone(&self.evaluator))
    }

    /// The loader registered under `name`.
    pub fn loader(&self, name: &str) -> Result<Arc<dyn Loader>, StepwiseError> {
        self.loaders.get(name).cloned().ok_or_else(|| {
            StepwiseError::definition(format!("loader '{name}' is not registered"))
        })
    }

    pub(crate) async fn emit(&self, event: &str, data: serde_json::Value) {
        self.event_sink.emit(event, Some(data)).await;
    }

    /// Runs a root pipeline and returns its context.
    ///
    /// A fresh context is created when none is given.
    pub async fn run(
        &self,
        request: &PipelineRequest,
        context: Option<Context>,
    ) -> Result<Context, StepwiseError> {
        let mut ctx = context.unwrap_or_else(|| self.new_context());
        self.run_with_context(request, &mut ctx).await?;
        Ok(ctx)
    }

    /// Runs a root pipeline against a caller-owned context.
    ///
    /// A `stop` anywhere on the call-stack ends the run successfully.
    pub async fn run_with_context(
        &self,
        request: &PipelineRequest,
        ctx: &mut Context,
    ) -> Result<(), StepwiseError> {
        match self.load_and_run(request, ctx, false).await {
            Ok(()) => Ok(()),
            Err(StepwiseError::Control(ControlFlow::Stop)) => {
                tracing::info!(pipeline = %request.name, "Stop: stopped all pipelines");
                Ok(())
            }
            Err(err) => Err(err.into_unhandled()),
        }
    }

    /// Runs a child pipeline on top of the context's current frame.
    ///
    /// `shares_parent_context` is true when `ctx` is the caller's own
    /// context rather than an isolated one.
    pub async fn invoke_child(
        &self,
        request: &PipelineRequest,
        ctx: &mut Context,
        shares_parent_context: bool,
    ) -> Result<(), StepwiseError> {
        self.load_and_run(request, ctx, shares_parent_context).await
    }

    fn select_loader(&self, request: &PipelineRequest, parent: Option<&PipelineCallFrame>) -> String {
        if let Some(loader) = &request.loader {
            return loader.clone();
        }
        match parent {
            Some(parent) if parent.is_loader_cascading => parent.loader.clone(),
            _ => self.config.default_loader.clone(),
        }
    }

    async fn load_and_run(
        &self,
        request: &PipelineRequest,
        ctx: &mut Context,
        shares_parent_context: bool,
    ) -> Result<(), StepwiseError> {
        let parent = ctx.current_pipeline().cloned();
        let loader_name = self.select_loader(request, parent.as_deref());
        let loader = self.loader(&loader_name)?;
        let parent_location = parent
            .as_deref()
            .and_then(PipelineCallFrame::child_lookup_location);
        tracing::debug!(
            pipeline = %request.name,
            loader = %loader_name,
            parent = ?parent_location,
            "loading pipeline"
        );
        let definition = loader.get_pipeline(&request.name, parent_location)?;

        let info = definition.info();
        let frame = Arc::new(
            PipelineCallFrame::child_of(parent, request.name.clone(), loader_name, shares_parent_context)
                .with_location(info.location.clone())
                .with_cascading(info.is_parent_cascading, info.is_loader_cascading),
        );
        let previous = ctx.replace_frame(Some(Arc::clone(&frame)));
        let outcome = self.run_definition(&definition, &frame, request, ctx).await;
        ctx.replace_frame(previous);
        outcome
    }

    async fn run_definition(
        &self,
        definition: &PipelineDefinition,
        frame: &PipelineCallFrame,
        request: &PipelineRequest,
        ctx: &mut Context,
    ) -> Result<(), StepwiseError> {
        tracing::info!(pipeline = %frame.name, depth = frame.depth(), "pipeline started");
        self.emit(
            "pipeline.started",
            serde_json::json!({
                "pipeline": frame.name,
                "run_id": frame.run_id.to_string(),
                "depth": frame.depth(),
                "shares_parent_context": frame.shares_parent_context,
            }),
        )
        .await;

        let runner = StepsRunner::new(definition, self, frame);
        let (groups, success, failure) = request.resolve_groups(&self.config);
        let outcome = match self.prepare_context(definition, request, ctx) {
            Ok(()) => {
                runner
                    .run_step_groups(ctx, &groups, success.as_deref(), failure.as_deref())
                    .await
            }
            Err(err) => {
                let err = runner.ensure_recorded(ctx, err);
                tracing::error!(pipeline = %frame.name, error = %err, "context parser failed");
                match failure.as_deref() {
                    Some(failure) => match runner.run_failure_step_group(ctx, failure).await {
                        Ok(()) | Err(StepwiseError::Control(ControlFlow::StopStepGroup)) => Err(err),
                        Err(signal) => Err(signal),
                    },
                    None => Err(err),
                }
            }
        };

        let elapsed_ms = (chrono::Utc::now() - frame.started_at).num_milliseconds();
        match outcome {
            Ok(()) => {
                tracing::info!(pipeline = %frame.name, elapsed_ms, "pipeline done");
                self.emit(
                    "pipeline.completed",
                    serde_json::json!({"pipeline": frame.name, "run_id": frame.run_id.to_string(), "elapsed_ms": elapsed_ms}),
                )
                .await;
                Ok(())
            }
            Err(StepwiseError::Control(signal @ (ControlFlow::StopPipeline | ControlFlow::Stop))) => {
                tracing::info!(pipeline = %frame.name, signal = %signal, "pipeline stopped");
                self.emit(
                    "pipeline.stopped",
                    serde_json::json!({"pipeline": frame.name, "run_id": frame.run_id.to_string(), "signal": signal.kind_name()}),
                )
                .await;
                match signal {
                    ControlFlow::StopPipeline => Ok(()),
                    other => Err(other.into()),
                }
            }
            Err(err) => {
                self.emit(
                    "pipeline.failed",
                    serde_json::json!({
                        "pipeline": frame.name,
                        "run_id": frame.run_id.to_string(),
                        "elapsed_ms": elapsed_ms,
                        "error": err.to_dict(),
                    }),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Applies the pipeline's context parser output, if any.
    fn prepare_context(
        &self,
        definition: &PipelineDefinition,
        request: &PipelineRequest,
        ctx: &mut Context,
    ) -> Result<(), StepwiseError> {
        if !request.parse_input {
            tracing::debug!(pipeline = %request.name, "skipping context parser");
            return Ok(());
        }
        let Some(parser_name) = definition.context_parser() else {
            tracing::debug!(pipeline = %request.name, "no context_parser, context is unchanged");
            return Ok(());
        };
        let parser = self.parsers.get(parser_name).ok_or_else(|| {
            StepwiseError::CollaboratorNotFound {
                name: parser_name.to_string(),
            }
        })?;
        let parsed = parser.parse(request.context_args.as_deref())?;
        tracing::debug!(parser = %parser_name, keys = parsed.len(), "context parser done");
        ctx.update(&parsed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Value;
    use crate::events::CollectingEventSink;
    use crate::invoker::loader::MockLoader;
    use crate::invoker::InMemoryLoader;
    use crate::pipeline::PipelineInfo;
    use pretty_assertions::assert_eq;

    fn memory_invoker(pipelines: &[(&str, &str)]) -> PipelineInvoker {
        let loader = InMemoryLoader::default();
        for (name, source) in pipelines {
            loader.add_pipeline(*name, source).unwrap();
        }
        PipelineInvoker::with_config(EngineConfig::new().with_default_loader("memory"))
            .with_loader(Arc::new(loader))
    }

    #[test]
    fn test_default_groups_bring_default_handlers() {
        let config = EngineConfig::default();
        let (groups, success, failure) = PipelineRequest::new("p").resolve_groups(&config);
        assert_eq!(groups, vec!["steps".to_string()]);
        assert_eq!(success.as_deref(), Some("on_success"));
        assert_eq!(failure.as_deref(), Some("on_failure"));

        let (groups, success, failure) = PipelineRequest::new("p")
            .with_groups(Some(vec!["a".to_string()]))
            .resolve_groups(&config);
        assert_eq!(groups, vec!["a".to_string()]);
        assert_eq!(success, None);
        assert_eq!(failure, None);
    }

    #[tokio::test]
    async fn test_run_creates_context() {
        let invoker = memory_invoker(&[(
            "main",
            "steps:\n  - name: set\n    in:\n      set:\n        greeting: hello {who}\non_success:\n  - name: set\n    in:\n      set:\n        done: true\n",
        )]);
        let ctx = invoker
            .run(
                &PipelineRequest::new("main"),
                Some(Context::from_json(serde_json::json!({"who": "world"}))),
            )
            .await
            .unwrap();
        assert_eq!(ctx.get("greeting"), Some(&Value::from("hello world")));
        assert_eq!(ctx.get("done"), Some(&Value::Bool(true)));
        assert!(ctx.current_pipeline().is_none());
    }

    #[tokio::test]
    async fn test_explicit_groups_skip_default_handlers() {
        let invoker = memory_invoker(&[(
            "main",
            "sg1:\n  - name: set\n    in:\n      set:\n        ran: sg1\non_success:\n  - name: set\n    in:\n      set:\n        handler: true\n",
        )]);
        let request = PipelineRequest::new("main").with_groups(Some(vec!["sg1".to_string()]));
        let ctx = invoker.run(&request, None).await.unwrap();
        assert_eq!(ctx.get("ran"), Some(&Value::from("sg1")));
        assert_eq!(ctx.get("handler"), None);
    }

    #[tokio::test]
    async fn test_missing_explicit_group_is_an_error() {
        let invoker = memory_invoker(&[("main", "steps: []")]);
        let request = PipelineRequest::new("main").with_groups(Some(vec!["nope".to_string()]));
        let err = invoker.run(&request, None).await.unwrap_err();
        assert_eq!(err.kind_name(), "PipelineDefinitionError");
    }

    #[tokio::test]
    async fn test_context_parser_seeds_context() {
        let invoker = memory_invoker(&[(
            "main",
            "context_parser: keyvaluepairs\nsteps:\n  - name: set\n    in:\n      set:\n        copied: '{pig}'\n",
        )]);
        let request = PipelineRequest::new("main")
            .with_context_args(Some(vec!["pig=ham".to_string()]));
        let ctx = invoker.run(&request, None).await.unwrap();
        assert_eq!(ctx.get("copied"), Some(&Value::from("ham")));

        let skipped = request.with_parse_input(false);
        let err = invoker.run(&skipped, None).await.unwrap_err();
        assert_eq!(err.kind_name(), "KeyNotInContextError");
    }

    #[tokio::test]
    async fn test_parser_failure_runs_failure_group() {
        let invoker = memory_invoker(&[(
            "main",
            "context_parser: keyvaluepairs\nsteps:\n  - name: set\n    in:\n      set:\n        ran: true\non_failure:\n  - name: set\n    in:\n      set:\n        handled: true\n",
        )]);
        let request = PipelineRequest::new("main").with_context_args(Some(vec!["bad".to_string()]));
        let mut ctx = invoker.new_context();
        let err = invoker.run_with_context(&request, &mut ctx).await.unwrap_err();
        assert_eq!(err.kind_name(), "ValueError");
        assert!(!err.is_handled());
        assert_eq!(ctx.get("ran"), None);
        assert_eq!(ctx.get("handled"), Some(&Value::Bool(true)));
        assert_eq!(ctx.run_errors().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_parser() {
        let invoker = memory_invoker(&[("main", "context_parser: nope\nsteps: []")]);
        let err = invoker.run(&PipelineRequest::new("main"), None).await.unwrap_err();
        assert_eq!(err.kind_name(), "CollaboratorNotFoundError");
    }

    #[tokio::test]
    async fn test_unknown_loader() {
        let invoker = PipelineInvoker::new();
        let request = PipelineRequest::new("main").with_loader(Some("nope".to_string()));
        let err = invoker.run(&request, None).await.unwrap_err();
        assert_eq!(err.kind_name(), "PipelineDefinitionError");
    }

    #[tokio::test]
    async fn test_stop_at_root_is_success() {
        let invoker = memory_invoker(&[(
            "main",
            "steps:\n  - name: set\n    in:\n      set:\n        before: 1\n  - stop\n  - name: set\n    in:\n      set:\n        after: 1\non_success:\n  - name: set\n    in:\n      set:\n        handler: 1\n",
        )]);
        let ctx = invoker.run(&PipelineRequest::new("main"), None).await.unwrap();
        assert_eq!(ctx.get("before"), Some(&Value::Int(1)));
        assert_eq!(ctx.get("after"), None);
        assert_eq!(ctx.get("handler"), None);
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let sink = Arc::new(CollectingEventSink::new());
        let invoker = memory_invoker(&[("main", "steps:\n  - name: set\n    in:\n      set:\n        a: 1\n")])
            .with_event_sink(sink.clone());
        invoker.run(&PipelineRequest::new("main"), None).await.unwrap();

        let names: Vec<String> = sink.events().into_iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec![
                "pipeline.started",
                "step_group.started",
                "step.started",
                "step.completed",
                "pipeline.completed",
            ]
        );
    }

    #[tokio::test]
    async fn test_loader_receives_parent_location_only_when_cascading() {
        let mut loader = MockLoader::new();
        loader
            .expect_get_pipeline()
            .withf(|name, parent| name == "main" && parent.is_none())
            .times(1)
            .returning(|_, _| {
                let info = PipelineInfo::new("main", "mock")
                    .with_location("/pipes")
                    .with_cascading(true, true);
                let definition = PipelineDefinition::from_yaml_str(
                    "steps:\n  - name: pype\n    in:\n      pype:\n        name: child\n",
                    info,
                )?;
                Ok(Arc::new(definition))
            });
        loader
            .expect_get_pipeline()
            .withf(|name, parent| {
                name == "child" && *parent == Some(std::path::Path::new("/pipes"))
            })
            .times(1)
            .returning(|_, _| {
                let definition = PipelineDefinition::from_yaml_str(
                    "steps:\n  - name: set\n    in:\n      set:\n        child_ran: true\n",
                    PipelineInfo::new("child", "mock"),
                )?;
                Ok(Arc::new(definition))
            });

        let invoker = PipelineInvoker::new().with_named_loader("mock", Arc::new(loader));
        let request = PipelineRequest::new("main").with_loader(Some("mock".to_string()));
        let ctx = invoker.run(&request, None).await.unwrap();
        assert_eq!(ctx.get("child_ran"), Some(&Value::Bool(true)));
    }
}
