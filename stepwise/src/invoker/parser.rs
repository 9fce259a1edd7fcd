//! Context parsers turn raw invocation arguments into the seed mapping.

use crate::context::{Map, Value};
use crate::errors::StepwiseError;

/// Turns raw invocation arguments into context entries.
pub trait ContextParser: Send + Sync {
    /// The name pipelines reference in `context_parser`.
    fn name(&self) -> &str;

    /// Parses the arguments. `None` means the pipeline was invoked without
    /// any.
    fn parse(&self, args: Option<&[String]>) -> Result<Map, StepwiseError>;
}

/// Parses `key=value` tokens into string entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyValuePairsParser;

impl ContextParser for KeyValuePairsParser {
    fn name(&self) -> &str {
        "keyvaluepairs"
    }

    fn parse(&self, args: Option<&[String]>) -> Result<Map, StepwiseError> {
        let Some(args) = args.filter(|args| !args.is_empty()) else {
            tracing::debug!("invoked without context args, keyvaluepairs expects key1=value1 key2=value2");
            return Ok(Map::new());
        };
        args.iter()
            .map(|token| {
                token
                    .split_once('=')
                    .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
                    .ok_or_else(|| {
                        StepwiseError::step_failed(
                            "ValueError",
                            format!("keyvaluepairs expects key=value, got '{token}'"),
                        )
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_pairs() {
        let parsed = KeyValuePairsParser
            .parse(Some(&args(&["pig=ham", "hen=eggs", "url=a=b"])))
            .unwrap();
        assert_eq!(parsed.get("pig"), Some(&Value::from("ham")));
        assert_eq!(parsed.get("hen"), Some(&Value::from("eggs")));
        assert_eq!(parsed.get("url"), Some(&Value::from("a=b")));
    }

    #[test]
    fn test_no_args_is_empty() {
        assert!(KeyValuePairsParser.parse(None).unwrap().is_empty());
        assert!(KeyValuePairsParser.parse(Some(&[])).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_token() {
        let err = KeyValuePairsParser.parse(Some(&args(&["oops"]))).unwrap_err();
        assert_eq!(err.kind_name(), "ValueError");
    }
}
