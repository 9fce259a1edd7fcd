//! Builds the script scope an expression runs in, and commits it back.

use rhai::{Dynamic, Scope};

use crate::context::{Map, Value, RUN_ERRORS_KEY};

/// A script scope layered over the context.
///
/// Every context key that is a valid identifier is bound by value at the
/// bottom of the scope. After the script runs, [`Namespace::commit`] writes
/// back bindings whose value changed, persists explicitly exported names,
/// and drops everything else the script declared.
///
/// Limits:
///
/// - Building copies every bound value into the scope, so evaluation cost
///   grows with the size of the context.
/// - `runErrors` is bound as a constant. Scripts can read it but cannot
///   change or export it.
/// - A changed value keeps the `!sic`/`!expr` marker of any string the
///   script left untouched. Strings the script rewrites become plain.
pub struct Namespace<'a> {
    context: &'a mut Map,
    scope: Scope<'static>,
    bound: Vec<(String, Value)>,
}

impl<'a> Namespace<'a> {
    /// Binds the context into a fresh scope.
    pub fn build(context: &'a mut Map) -> Self {
        let mut scope = Scope::new();
        let mut bound = Vec::new();
        for (key, value) in context.iter() {
            if !is_identifier(key) {
                continue;
            }
            let dynamic = to_dynamic(value);
            bound.push((key.clone(), from_dynamic(dynamic.clone())));
            if key == RUN_ERRORS_KEY {
                scope.push_constant_dynamic(key.as_str(), dynamic);
            } else {
                scope.push_dynamic(key.as_str(), dynamic);
            }
        }
        tracing::trace!(bound = bound.len(), "Built expression namespace");
        Self {
            context,
            scope,
            bound,
        }
    }

    /// The scope to run the script in.
    pub fn scope_mut(&mut self) -> &mut Scope<'static> {
        &mut self.scope
    }

    /// Writes changes back to the context and discards scratch bindings.
    pub fn commit(mut self, exports: &[String]) {
        let base = self.bound.len();
        let after: Vec<Value> = self
            .scope
            .iter()
            .take(base)
            .map(|(_, _, value)| from_dynamic(value))
            .collect();

        for ((key, before), after) in self.bound.iter().zip(after) {
            if &after == before || key == RUN_ERRORS_KEY {
                continue;
            }
            let merged = match self.context.get(key) {
                Some(original) => keep_order(after, original),
                None => after,
            };
            tracing::debug!(key = %key, "Expression changed context value");
            self.context.insert(key.clone(), merged);
        }

        for name in exports {
            if name == RUN_ERRORS_KEY {
                tracing::warn!(key = %name, "runErrors is read-only, not exporting");
                continue;
            }
            let exported = self
                .scope
                .iter()
                .skip(base)
                .filter(|(binding, _, _)| *binding == name.as_str())
                .last()
                .map(|(_, _, value)| from_dynamic(value));
            match exported {
                Some(value) => {
                    tracing::debug!(key = %name, "Exporting expression binding");
                    self.context.insert(name.clone(), value);
                }
                None => tracing::debug!(key = %name, "Export not bound by expression"),
            }
        }

        self.scope.rewind(base);
    }
}

/// Rhai identifiers: a letter or underscore, then letters, digits or
/// underscores.
fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Converts a context value into a script value.
pub(crate) fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(*b),
        Value::Int(i) => Dynamic::from_int(*i),
        Value::Float(f) => Dynamic::from_float(*f),
        Value::String(s) | Value::Literal(s) | Value::Expr(s) => Dynamic::from(s.clone()),
        Value::List(items) => Dynamic::from_array(items.iter().map(to_dynamic).collect()),
        Value::Map(map) => {
            let mut out = rhai::Map::new();
            for (key, value) in map {
                out.insert(key.as_str().into(), to_dynamic(value));
            }
            Dynamic::from_map(out)
        }
    }
}

/// Converts a script value back into a context value.
pub(crate) fn from_dynamic(value: Dynamic) -> Value {
    let value = value.flatten();
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::Int(i);
    }
    if let Ok(f) = value.as_float() {
        return Value::Float(f);
    }
    if let Ok(c) = value.as_char() {
        return Value::String(c.to_string());
    }
    if value.is_string() {
        return value.into_string().map_or(Value::Null, Value::String);
    }
    if value.is_array() {
        return value.into_array().map_or(Value::Null, |items| {
            Value::List(items.into_iter().map(from_dynamic).collect())
        });
    }
    if value.is_map() {
        return value.try_cast::<rhai::Map>().map_or(Value::Null, |map| {
            Value::Map(
                map.into_iter()
                    .map(|(key, value)| (key.to_string(), from_dynamic(value)))
                    .collect(),
            )
        });
    }
    Value::String(value.to_string())
}

/// Script maps are sorted by key; restore the context's key order and the
/// string markers of values the script did not change.
fn keep_order(updated: Value, original: &Value) -> Value {
    match (updated, original) {
        (Value::String(text), Value::Literal(marked)) if text == *marked => Value::Literal(text),
        (Value::String(text), Value::Expr(marked)) if text == *marked => Value::Expr(text),
        (Value::List(updated), Value::List(original)) => Value::List(
            updated
                .into_iter()
                .enumerate()
                .map(|(index, after)| match original.get(index) {
                    Some(before) => keep_order(after, before),
                    None => after,
                })
                .collect(),
        ),
        (Value::Map(mut updated), Value::Map(original)) => {
            let mut ordered = Map::with_capacity(updated.len());
            for (key, before) in original {
                if let Some(after) = updated.shift_remove(key) {
                    ordered.insert(key.clone(), keep_order(after, before));
                }
            }
            ordered.extend(updated);
            Value::Map(ordered)
        }
        (updated, _) => updated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("abc"));
        assert!(is_identifier("_a1"));
        assert!(!is_identifier("1a"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_dynamic_conversion() {
        let value = Value::from(json!({"a": [1, 2.5, "x", null, true], "m": {"k": "v"}}));
        assert_eq!(from_dynamic(to_dynamic(&value)), value);
    }

    #[test]
    fn test_keep_order_restores_original_order() {
        let original = Value::from(json!({"z": 1, "a": {"y": 1, "b": 2}}));
        let updated = Value::from(json!({"a": {"b": 3, "y": 1}, "new": 0, "z": 1}));
        let Value::Map(ordered) = keep_order(updated, &original) else {
            panic!("expected map");
        };
        assert_eq!(ordered.keys().collect::<Vec<_>>(), vec!["z", "a", "new"]);
        assert_eq!(
            ordered["a"].as_map().unwrap().keys().collect::<Vec<_>>(),
            vec!["y", "b"]
        );
    }

    #[test]
    fn test_keep_order_preserves_untouched_markers() {
        let original = Value::Map(
            [
                ("raw".to_string(), Value::Literal("{x}".to_string())),
                ("items".to_string(), Value::List(vec![Value::Expr("1 + 1".to_string())])),
                ("changed".to_string(), Value::Literal("old".to_string())),
            ]
            .into_iter()
            .collect(),
        );
        let updated = Value::from(json!({"changed": "new", "items": ["1 + 1", 2], "raw": "{x}"}));
        let Value::Map(merged) = keep_order(updated, &original) else {
            panic!("expected map");
        };
        assert_eq!(merged["raw"], Value::Literal("{x}".to_string()));
        assert_eq!(
            merged["items"],
            Value::List(vec![Value::Expr("1 + 1".to_string()), Value::Int(2)])
        );
        assert_eq!(merged["changed"], Value::from("new"));
    }

    #[test]
    fn test_run_errors_are_read_only() {
        let mut context = Value::from(json!({"runErrors": [{"name": "ValueError"}], "n": 1}))
            .as_map()
            .unwrap()
            .clone();
        let engine = rhai::Engine::new();

        let mut namespace = Namespace::build(&mut context);
        let result = engine.run_with_scope(namespace.scope_mut(), "runErrors = []; n = 2;");
        namespace.commit(&["runErrors".to_string()]);
        assert!(result.is_err());

        let mut namespace = Namespace::build(&mut context);
        engine
            .run_with_scope(namespace.scope_mut(), "n = runErrors.len() + 5;")
            .unwrap();
        namespace.commit(&[]);

        assert_eq!(context["n"], Value::Int(6));
        assert_eq!(context["runErrors"], Value::from(json!([{"name": "ValueError"}])));
    }

    #[test]
    fn test_non_identifier_keys_are_not_bound() {
        let mut context = Value::from(json!({"ok": 1, "not-ok": 2})).as_map().unwrap().clone();
        let namespace = Namespace::build(&mut context);
        assert_eq!(namespace.bound.len(), 1);
        namespace.commit(&[]);
        assert_eq!(context.len(), 2);
    }
}
