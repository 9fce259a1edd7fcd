//! The three write semantics: set, default and merge.
//!
//! All three format the incoming keys and values against the context before
//! writing. Nested targets are addressed by key path so that formatting can
//! read the context between writes.

use super::value::Shape;
use super::{Context, Map, Value};
use crate::errors::FormattingError;

impl Context {
    /// Overwrites each top-level key with its formatted value.
    pub fn set_values(&mut self, values: &Map) -> Result<(), FormattingError> {
        for (key, value) in values {
            let key = self.format_key(key, false, 0)?;
            let value = self.get_formatted_value(value)?;
            tracing::debug!(key = %key, "set");
            self.data.insert(key, value);
        }
        Ok(())
    }

    /// Writes formatted defaults for keys that do not exist yet.
    ///
    /// Recurses into nested mappings that exist on both sides, adding only
    /// the missing nested keys. Never overwrites, and never descends into
    /// lists. A default that is not written is not formatted either.
    pub fn set_defaults(&mut self, defaults: &Map) -> Result<(), FormattingError> {
        self.defaults_at(&[], defaults)
    }

    /// Deep-merges `add_me` into the context.
    ///
    /// Mappings merge key by key, lists are extended without de-duplication,
    /// and anything else (strings included) overwrites.
    pub fn merge(&mut self, add_me: &Map) -> Result<(), FormattingError> {
        self.merge_at(&[], add_me)
    }

    fn defaults_at(&mut self, path: &[String], defaults: &Map) -> Result<(), FormattingError> {
        for (key, value) in defaults {
            let key = self.format_key(key, false, 0)?;
            let child_path = extend(path, &key);
            let existing = node_at(&self.data, &child_path).map(Value::shape);
            match (existing, value) {
                (Some(Shape::Map), Value::Map(nested)) => self.defaults_at(&child_path, nested)?,
                (Some(_), _) => {}
                (None, _) => {
                    let formatted = self.get_formatted_value(value)?;
                    if let Some(target) = map_at_mut(&mut self.data, path) {
                        target.insert(key, formatted);
                    }
                }
            }
        }
        Ok(())
    }

    fn merge_at(&mut self, path: &[String], add_me: &Map) -> Result<(), FormattingError> {
        for (key, value) in add_me {
            let key = self.format_key(key, false, 0)?;
            let child_path = extend(path, &key);
            let existing = node_at(&self.data, &child_path).map(Value::shape);
            match (existing, value) {
                (Some(Shape::Map), Value::Map(nested)) => self.merge_at(&child_path, nested)?,
                (Some(Shape::List), Value::List(_)) => {
                    let Value::List(formatted) = self.get_formatted_value(value)? else {
                        continue;
                    };
                    if let Some(Value::List(target)) = node_at_mut(&mut self.data, &child_path) {
                        target.extend(formatted);
                    }
                }
                _ => {
                    let formatted = self.get_formatted_value(value)?;
                    if let Some(target) = map_at_mut(&mut self.data, path) {
                        target.insert(key, formatted);
                    }
                }
            }
        }
        Ok(())
    }
}

fn extend(path: &[String], key: &str) -> Vec<String> {
    let mut child = path.to_vec();
    child.push(key.to_string());
    child
}

fn node_at<'a>(data: &'a Map, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = data.get(first)?;
    for key in rest {
        current = current.as_map()?.get(key)?;
    }
    Some(current)
}

fn node_at_mut<'a>(data: &'a mut Map, path: &[String]) -> Option<&'a mut Value> {
    let (first, rest) = path.split_first()?;
    let mut current = data.get_mut(first)?;
    for key in rest {
        current = current.as_map_mut()?.get_mut(key)?;
    }
    Some(current)
}

fn map_at_mut<'a>(data: &'a mut Map, path: &[String]) -> Option<&'a mut Map> {
    if path.is_empty() {
        return Some(data);
    }
    node_at_mut(data, path)?.as_map_mut()
}
