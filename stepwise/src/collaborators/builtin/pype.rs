//! The `pype` collaborator: runs a child pipeline.

use async_trait::async_trait;

use crate::collaborators::Collaborator;
use crate::context::{parse_bool_text, Context, Map, RunErrorRecord, Value};
use crate::errors::{ContextError, StepwiseError};
use crate::invoker::{PipelineInvoker, PipelineRequest};

const CALLER: &str = "pype";

/// Which child keys are copied back into the parent after an isolated run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutMapping {
    /// Nothing is copied.
    #[default]
    None,
    /// One key, copied under the same name.
    Key(String),
    /// Several keys, copied under the same names.
    Keys(Vec<String>),
    /// Parent destination key to child source key.
    Map(Vec<(String, String)>),
}

impl OutMapping {
    fn from_value(value: Option<&Value>) -> Result<Self, StepwiseError> {
        match value {
            None | Some(Value::Null) => Ok(Self::None),
            Some(Value::String(key) | Value::Literal(key)) => Ok(Self::Key(key.clone())),
            Some(Value::List(keys)) => keys
                .iter()
                .map(|key| {
                    key.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| invalid("pype.out list entries must be strings"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Keys),
            Some(Value::Map(map)) => map
                .iter()
                .map(|(dest, source)| {
                    source
                        .as_str()
                        .map(|source| (dest.clone(), source.to_string()))
                        .ok_or_else(|| invalid("pype.out mapping values must be child key names"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Map),
            Some(other) => Err(ContextError::WrongType {
                key: "pype.out".to_string(),
                expected: "a string, list or mapping".to_string(),
                found: other.type_name().to_string(),
                caller: CALLER.to_string(),
            }
            .into()),
        }
    }

    /// Returns true when nothing is mapped back.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Copies the mapped keys from `child` into `parent`.
    pub fn apply(&self, child: &Context, parent: &mut Context) -> Result<(), StepwiseError> {
        let pairs: Vec<(&str, &str)> = match self {
            Self::None => return Ok(()),
            Self::Key(key) => vec![(key.as_str(), key.as_str())],
            Self::Keys(keys) => keys.iter().map(|k| (k.as_str(), k.as_str())).collect(),
            Self::Map(pairs) => pairs.iter().map(|(d, s)| (d.as_str(), s.as_str())).collect(),
        };
        for (dest, source) in pairs {
            let value = child.assert_key_exists(source, "pype.out")?.clone();
            tracing::debug!(source = %source, dest = %dest, "pype.out: copying child key to parent");
            parent.insert(dest, value);
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> StepwiseError {
    ContextError::Invalid(message.into()).into()
}

fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::String(text) => parse_bool_text(text),
        other => other.is_truthy(),
    }
}

fn optional_string(map: &Map, key: &str) -> Result<Option<String>, StepwiseError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text) | Value::Literal(text)) => Ok(Some(text.clone())),
        Some(other) => Err(ContextError::WrongType {
            key: format!("pype.{key}"),
            expected: "a string".to_string(),
            found: other.type_name().to_string(),
            caller: CALLER.to_string(),
        }
        .into()),
    }
}

/// A parsed `pype` configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildInvocation {
    /// Child pipeline name.
    pub name: String,
    /// Seed for an isolated child context.
    pub args: Option<Map>,
    /// Whether the child runs on the caller's context.
    pub use_parent_context: bool,
    /// Keys copied back after an isolated run.
    pub out: OutMapping,
    /// Whether child failures propagate.
    pub raise_error: bool,
    /// Explicit loader name.
    pub loader: Option<String>,
    /// Explicit step-groups.
    pub groups: Option<Vec<String>>,
    /// Explicit success group.
    pub success_group: Option<String>,
    /// Explicit failure group.
    pub failure_group: Option<String>,
    /// Raw arguments for the child's context parser.
    pub pipe_arg: Option<Vec<String>>,
    /// Whether the child's context parser is bypassed.
    pub skip_parse: bool,
}

impl ChildInvocation {
    /// Reads and formats context key `pype`.
    pub fn from_context(ctx: &mut Context) -> Result<Self, StepwiseError> {
        ctx.assert_key_has_value("pype", CALLER)?;
        let formatted = ctx.get_formatted("pype")?;
        let Value::Map(config) = formatted else {
            return Err(ContextError::WrongType {
                key: "pype".to_string(),
                expected: "a mapping".to_string(),
                found: formatted.type_name().to_string(),
                caller: CALLER.to_string(),
            }
            .into());
        };
        Self::from_map(&config)
    }

    fn from_map(config: &Map) -> Result<Self, StepwiseError> {
        let name = match config.get("name") {
            None => {
                return Err(ContextError::KeyNotFound {
                    key: "pype.name".to_string(),
                    caller: CALLER.to_string(),
                }
                .into())
            }
            Some(Value::Null) => {
                return Err(ContextError::NoValue {
                    key: "pype.name".to_string(),
                    caller: CALLER.to_string(),
                }
                .into())
            }
            Some(value) => match value.as_str() {
                Some(name) => name.to_string(),
                None => return Err(invalid("pype.name must be a string")),
            },
        };

        let args = match config.get("args") {
            None | Some(Value::Null) => None,
            Some(Value::Map(args)) => Some(args.clone()),
            Some(other) => {
                return Err(ContextError::WrongType {
                    key: "pype.args".to_string(),
                    expected: "a mapping".to_string(),
                    found: other.type_name().to_string(),
                    caller: CALLER.to_string(),
                }
                .into())
            }
        };

        let explicit_parent = config
            .get("useParentContext")
            .filter(|v| !v.is_null())
            .map(coerce_bool);
        if args.is_some() && explicit_parent == Some(true) {
            return Err(invalid(
                "pype 'args' needs a fresh context. Don't combine 'args' with useParentContext: True",
            ));
        }
        let use_parent_context = explicit_parent.unwrap_or(args.is_none());

        let groups = match config.get("groups") {
            None | Some(Value::Null) => None,
            Some(Value::String(group) | Value::Literal(group)) => Some(vec![group.clone()]),
            Some(Value::List(groups)) => Some(
                groups
                    .iter()
                    .map(|g| {
                        g.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| invalid("pype.groups entries must be strings"))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Some(other) => {
                return Err(ContextError::WrongType {
                    key: "pype.groups".to_string(),
                    expected: "a string or list".to_string(),
                    found: other.type_name().to_string(),
                    caller: CALLER.to_string(),
                }
                .into())
            }
        };

        let pipe_arg = optional_string(config, "pipeArg")?
            .map(|arg| arg.split_whitespace().map(str::to_string).collect());

        Ok(Self {
            name,
            args,
            use_parent_context,
            out: OutMapping::from_value(config.get("out"))?,
            raise_error: config.get("raiseError").map_or(true, coerce_bool),
            loader: optional_string(config, "loader")?,
            groups,
            success_group: optional_string(config, "success")?,
            failure_group: optional_string(config, "failure")?,
            pipe_arg,
            skip_parse: config.get("skipParse").map_or(true, coerce_bool),
        })
    }

    /// The invoker request this configuration describes.
    #[must_use]
    pub fn request(&self) -> PipelineRequest {
        PipelineRequest::new(self.name.clone())
            .with_loader(self.loader.clone())
            .with_groups(self.groups.clone())
            .with_success_group(self.success_group.clone())
            .with_failure_group(self.failure_group.clone())
            .with_context_args(self.pipe_arg.clone())
            .with_parse_input(!self.skip_parse)
    }
}

/// Runs a child pipeline on a shared or isolated context.
#[derive(Debug, Clone, Copy, Default)]
pub struct PypeStep;

#[async_trait]
impl Collaborator for PypeStep {
    fn name(&self) -> &str {
        CALLER
    }

    async fn run(&self, ctx: &mut Context, invoker: &PipelineInvoker) -> Result<(), StepwiseError> {
        let invocation = ChildInvocation::from_context(ctx)?;
        let request = invocation.request();
        tracing::info!(
            pipeline = %invocation.name,
            use_parent_context = invocation.use_parent_context,
            "pype: invoking child pipeline"
        );

        let outcome = if invocation.use_parent_context {
            if !invocation.out.is_none() {
                tracing::warn!(pipeline = %invocation.name, "pype.out is ignored when the child shares the parent context");
            }
            invoker.invoke_child(&request, ctx, true).await
        } else {
            let mut child = ctx.isolated(invocation.args.clone().unwrap_or_default());
            match invoker.invoke_child(&request, &mut child, false).await {
                Ok(()) => invocation.out.apply(&child, ctx),
                Err(err) => Err(err.into_unhandled()),
            }
        };

        match outcome {
            Ok(()) => {
                tracing::info!(pipeline = %invocation.name, "pype: child pipeline done");
                Ok(())
            }
            Err(err) if err.is_control_flow() || invocation.raise_error => Err(err),
            Err(err) => {
                tracing::error!(
                    pipeline = %invocation.name,
                    error = %err,
                    "pype: child pipeline failed and raiseError is false, continuing"
                );
                if !err.is_handled() {
                    ctx.record_error(
                        RunErrorRecord::from_error(&err)
                            .with_step(CALLER)
                            .with_swallowed(true),
                    );
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(config: serde_json::Value) -> Result<ChildInvocation, StepwiseError> {
        let mut ctx = Context::from_json(serde_json::json!({ "pype": config, "who": "child" }));
        ChildInvocation::from_context(&mut ctx)
    }

    #[test]
    fn test_defaults_share_context() {
        let invocation = parse(serde_json::json!({"name": "{who}"})).unwrap();
        assert_eq!(invocation.name, "child");
        assert!(invocation.use_parent_context);
        assert!(invocation.raise_error);
        assert!(invocation.skip_parse);
        assert!(invocation.out.is_none());
        assert_eq!(invocation.groups, None);
    }

    #[test]
    fn test_args_force_isolation() {
        let invocation = parse(serde_json::json!({"name": "c", "args": {"x": 1}})).unwrap();
        assert!(!invocation.use_parent_context);

        let err = parse(serde_json::json!({"name": "c", "args": {"x": 1}, "useParentContext": true}))
            .unwrap_err();
        assert_eq!(err.kind_name(), "ContextError");

        let invocation =
            parse(serde_json::json!({"name": "c", "useParentContext": "False"})).unwrap();
        assert!(!invocation.use_parent_context);
    }

    #[test]
    fn test_missing_name() {
        let err = parse(serde_json::json!({"args": {}})).unwrap_err();
        assert_eq!(err.kind_name(), "KeyNotInContextError");
        let err = parse(serde_json::json!({"name": null})).unwrap_err();
        assert_eq!(err.kind_name(), "KeyInContextHasNoValueError");
    }

    #[test]
    fn test_out_shapes() {
        let single = parse(serde_json::json!({"name": "c", "out": "a"})).unwrap();
        assert_eq!(single.out, OutMapping::Key("a".to_string()));

        let list = parse(serde_json::json!({"name": "c", "out": ["a", "b"]})).unwrap();
        assert_eq!(list.out, OutMapping::Keys(vec!["a".to_string(), "b".to_string()]));

        let map = parse(serde_json::json!({"name": "c", "out": {"parentKey": "childKey"}})).unwrap();
        assert_eq!(
            map.out,
            OutMapping::Map(vec![("parentKey".to_string(), "childKey".to_string())])
        );
    }

    #[test]
    fn test_out_apply() {
        let child = Context::from_json(serde_json::json!({"childKey": 7, "a": "x"}));
        let mut parent = Context::from_json(serde_json::json!({"keep": true}));
        OutMapping::Map(vec![("parentKey".to_string(), "childKey".to_string())])
            .apply(&child, &mut parent)
            .unwrap();
        OutMapping::Key("a".to_string()).apply(&child, &mut parent).unwrap();
        assert_eq!(parent.get("parentKey"), Some(&Value::Int(7)));
        assert_eq!(parent.get("a"), Some(&Value::from("x")));
        assert_eq!(parent.get("keep"), Some(&Value::Bool(true)));

        let err = OutMapping::Key("nope".to_string())
            .apply(&child, &mut parent)
            .unwrap_err();
        assert_eq!(err.kind_name(), "KeyNotInContextError");
    }

    #[test]
    fn test_request_fields() {
        let invocation = parse(serde_json::json!({
            "name": "c",
            "groups": "sg1",
            "success": "ok",
            "loader": "memory",
            "pipeArg": "a=1  b=2",
            "skipParse": false,
            "raiseError": false,
        }))
        .unwrap();
        assert_eq!(invocation.groups, Some(vec!["sg1".to_string()]));
        assert_eq!(
            invocation.pipe_arg,
            Some(vec!["a=1".to_string(), "b=2".to_string()])
        );
        assert!(!invocation.raise_error);

        let request = invocation.request();
        assert_eq!(request.loader.as_deref(), Some("memory"));
        assert_eq!(request.success_group.as_deref(), Some("ok"));
        assert!(request.parse_input);
    }
}
