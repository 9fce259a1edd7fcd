//! String interpolation against the context.
//!
//! Templates contain `{key}` fields, optionally indexed (`{key[a][0]}`) and
//! optionally carrying a recursion spec (`{key:ff}` flat, `{key:rf}`
//! recursive). `{{` and `}}` escape literal braces. A template that is
//! exactly one field returns the field's typed value; anything else is
//! rendered to a string.

use std::sync::Arc;

use super::{Context, Map, Value};
use crate::errors::{ContextError, ExpressionError, FormattingError, StepwiseError};

/// Nesting limit for recursive formatting.
pub const MAX_FORMAT_DEPTH: usize = 64;

/// How a field's resolved value is itself formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum RecursionSpec {
    /// Inherit the caller's mode.
    #[default]
    Default,
    /// `ff`: never format the resolved value.
    Flat,
    /// `rf`: format the resolved value recursively.
    Recursive,
}

/// A parsed `{...}` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Field {
    pub expression: String,
    pub root: String,
    pub indices: Vec<String>,
    pub spec: RecursionSpec,
}

/// A piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Text(String),
    Field(Field),
}

/// Splits a template into literal text and fields.
pub(crate) fn parse(template: &str) -> Result<Vec<Segment>, FormattingError> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    text.push('{');
                    continue;
                }
                let mut body = String::new();
                let mut in_index = false;
                let mut closed = false;
                for c in chars.by_ref() {
                    match c {
                        '[' if !in_index => {
                            in_index = true;
                            body.push(c);
                        }
                        ']' if in_index => {
                            in_index = false;
                            body.push(c);
                        }
                        '}' if !in_index => {
                            closed = true;
                            break;
                        }
                        '{' if !in_index => {
                            return Err(FormattingError::malformed(
                                template,
                                "unexpected '{' in field name",
                            ));
                        }
                        _ => body.push(c),
                    }
                }
                if !closed {
                    return Err(FormattingError::malformed(
                        template,
                        "expected '}' before end of string",
                    ));
                }
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Field(parse_field(template, &body)?));
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                    text.push('}');
                } else {
                    return Err(FormattingError::malformed(
                        template,
                        "single '}' encountered in format string",
                    ));
                }
            }
            _ => text.push(c),
        }
    }

    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(segments)
}

fn parse_field(template: &str, body: &str) -> Result<Field, FormattingError> {
    let mut in_index = false;
    let mut split_at = None;
    for (pos, c) in body.char_indices() {
        match c {
            '[' => in_index = true,
            ']' => in_index = false,
            ':' if !in_index => {
                split_at = Some(pos);
                break;
            }
            _ => {}
        }
    }
    let (name, spec) = match split_at {
        Some(pos) => (&body[..pos], &body[pos + 1..]),
        None => (body, ""),
    };

    let spec = match spec {
        "" => RecursionSpec::Default,
        "ff" => RecursionSpec::Flat,
        "rf" => RecursionSpec::Recursive,
        other => {
            return Err(FormattingError::malformed(
                template,
                format!("unsupported format spec '{other}'"),
            ))
        }
    };

    let root_end = name.find('[').unwrap_or(name.len());
    let root = &name[..root_end];
    if root.is_empty() {
        return Err(FormattingError::malformed(
            template,
            "empty field name; positional fields are not supported",
        ));
    }

    let mut indices = Vec::new();
    let mut rest = &name[root_end..];
    while !rest.is_empty() {
        let Some(after_open) = rest.strip_prefix('[') else {
            return Err(FormattingError::malformed(
                template,
                "only '[' may follow ']' in a field name",
            ));
        };
        let Some(close) = after_open.find(']') else {
            return Err(FormattingError::malformed(template, "missing ']' in field name"));
        };
        let index = &after_open[..close];
        if index.is_empty() {
            return Err(FormattingError::malformed(template, "empty index in field name"));
        }
        indices.push(index.to_string());
        rest = &after_open[close + 1..];
    }

    Ok(Field {
        expression: name.to_string(),
        root: root.to_string(),
        indices,
        spec,
    })
}

/// Resolves a field against the context data.
pub(crate) fn resolve(data: &Map, field: &Field) -> Result<Value, FormattingError> {
    let mut current = data.get(&field.root).ok_or_else(|| FormattingError::KeyNotFound {
        key: field.root.clone(),
        expression: field.expression.clone(),
    })?;

    for index in &field.indices {
        current = match current {
            Value::Map(map) => map.get(index).ok_or_else(|| FormattingError::KeyNotFound {
                key: index.clone(),
                expression: field.expression.clone(),
            })?,
            Value::List(items) => {
                let position: usize = index.parse().map_err(|_| {
                    FormattingError::NotSubscriptable {
                        expression: field.expression.clone(),
                        type_name: format!("list by non-integer index '{index}'"),
                    }
                })?;
                items
                    .get(position)
                    .ok_or_else(|| FormattingError::IndexOutOfRange {
                        expression: field.expression.clone(),
                        index: index.clone(),
                    })?
            }
            Value::String(s) | Value::Literal(s) if is_last(field, index) => {
                let position: usize = index.parse().map_err(|_| {
                    FormattingError::NotSubscriptable {
                        expression: field.expression.clone(),
                        type_name: format!("str by non-integer index '{index}'"),
                    }
                })?;
                return s
                    .chars()
                    .nth(position)
                    .map(|c| Value::String(c.to_string()))
                    .ok_or_else(|| FormattingError::IndexOutOfRange {
                        expression: field.expression.clone(),
                        index: index.clone(),
                    });
            }
            other => {
                return Err(FormattingError::NotSubscriptable {
                    expression: field.expression.clone(),
                    type_name: other.type_name().to_string(),
                })
            }
        };
    }
    Ok(current.clone())
}

fn is_last(field: &Field, index: &String) -> bool {
    field
        .indices
        .last()
        .is_some_and(|last| std::ptr::eq(last, index))
}

/// Parses the text form of a boolean decorator value.
///
/// `true`/`1`/`1.0` and `false`/`0`/`0.0`/empty are recognised
/// case-insensitively. Any other non-empty text is true.
#[must_use]
pub fn parse_bool_text(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    !matches!(
        trimmed.to_ascii_lowercase().as_str(),
        "false" | "0" | "0.0"
    )
}

impl Context {
    /// Formats the value stored at `key`.
    pub fn get_formatted(&mut self, key: &str) -> Result<Value, StepwiseError> {
        let raw = self
            .get(key)
            .cloned()
            .ok_or_else(|| ContextError::KeyNotFound {
                key: key.to_string(),
                caller: "get_formatted".to_string(),
            })?;
        Ok(self.get_formatted_value(&raw)?)
    }

    /// Formats any value against the context.
    ///
    /// Strings are interpolated, nested lists and mappings are walked (keys
    /// included), literals come back verbatim and expressions are evaluated.
    pub fn get_formatted_value(&mut self, input: &Value) -> Result<Value, FormattingError> {
        self.format_value(input, false, 0)
    }

    /// Formats a template and renders the result as a string.
    pub fn get_formatted_string(&mut self, template: &str) -> Result<String, FormattingError> {
        match self.format_template(template, false, 0)? {
            Value::String(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }

    /// Formats a decorator value and coerces it to a boolean.
    pub fn get_formatted_bool(&mut self, input: &Value) -> Result<bool, FormattingError> {
        Ok(match self.get_formatted_value(input)? {
            Value::String(s) => parse_bool_text(&s),
            other => other.is_truthy(),
        })
    }

    /// Formats a value and coerces it to an integer.
    pub fn get_formatted_int(&mut self, input: &Value, label: &str) -> Result<i64, StepwiseError> {
        let formatted = self.get_formatted_value(input)?;
        let parsed = match &formatted {
            Value::Int(i) => Some(*i),
            #[allow(clippy::cast_possible_truncation)]
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| wrong_type(label, "an integer", &formatted))
    }

    /// Formats a value and coerces it to a float.
    pub fn get_formatted_float(&mut self, input: &Value, label: &str) -> Result<f64, StepwiseError> {
        let formatted = self.get_formatted_value(input)?;
        let parsed = match &formatted {
            Value::String(s) => s.trim().parse().ok(),
            other => other.as_f64(),
        };
        parsed.ok_or_else(|| wrong_type(label, "a number", &formatted))
    }

    /// Formats a value that must be iterable: a list, or a mapping's keys.
    pub fn get_formatted_list(
        &mut self,
        input: &Value,
        label: &str,
    ) -> Result<Vec<Value>, StepwiseError> {
        match self.get_formatted_value(input)? {
            Value::List(items) => Ok(items),
            Value::Map(map) => Ok(map.into_keys().map(Value::String).collect()),
            other => Err(wrong_type(label, "a list", &other)),
        }
    }

    /// Evaluates a dynamic expression against the context.
    pub fn eval_expression(&mut self, expression: &str) -> Result<Value, ExpressionError> {
        let evaluator = Arc::clone(&self.evaluator);
        evaluator.evaluate(expression, &mut self.data)
    }

    /// Executes a statement block against the context.
    ///
    /// Container mutation persists; new top-level bindings persist only when
    /// named in `exports`.
    pub fn execute_statements(
        &mut self,
        code: &str,
        exports: &[String],
    ) -> Result<(), ExpressionError> {
        let evaluator = Arc::clone(&self.evaluator);
        evaluator.execute(code, &mut self.data, exports)
    }

    pub(crate) fn format_value(
        &mut self,
        input: &Value,
        recursive: bool,
        depth: usize,
    ) -> Result<Value, FormattingError> {
        if depth > MAX_FORMAT_DEPTH {
            return Err(FormattingError::RecursionLimit {
                template: input.to_string(),
                limit: MAX_FORMAT_DEPTH,
            });
        }
        match input {
            Value::String(template) => self.format_template(template, recursive, depth),
            Value::Literal(text) => Ok(Value::String(text.clone())),
            Value::Expr(expression) => Ok(self.eval_expression(expression)?),
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.format_value(item, recursive, depth + 1)?);
                }
                Ok(Value::List(out))
            }
            Value::Map(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, value) in map {
                    let key = self.format_key(key, recursive, depth)?;
                    let value = self.format_value(value, recursive, depth + 1)?;
                    out.insert(key, value);
                }
                Ok(Value::Map(out))
            }
            other => Ok(other.clone()),
        }
    }

    pub(crate) fn format_key(
        &mut self,
        key: &str,
        recursive: bool,
        depth: usize,
    ) -> Result<String, FormattingError> {
        if !key.contains(['{', '}']) {
            return Ok(key.to_string());
        }
        Ok(match self.format_template(key, recursive, depth + 1)? {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    fn format_template(
        &mut self,
        template: &str,
        recursive: bool,
        depth: usize,
    ) -> Result<Value, FormattingError> {
        if depth > MAX_FORMAT_DEPTH {
            return Err(FormattingError::RecursionLimit {
                template: template.to_string(),
                limit: MAX_FORMAT_DEPTH,
            });
        }
        if !template.contains(['{', '}']) {
            return Ok(Value::String(template.to_string()));
        }

        let segments = parse(template)?;
        if let [Segment::Field(field)] = segments.as_slice() {
            let value = resolve(&self.data, field)?;
            return match field.spec {
                RecursionSpec::Flat => Ok(value),
                RecursionSpec::Recursive => self.format_value(&value, true, depth + 1),
                RecursionSpec::Default => self.format_value(&value, recursive, depth + 1),
            };
        }

        let mut out = String::with_capacity(template.len());
        for segment in &segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Field(field) => {
                    let mut value = resolve(&self.data, field)?;
                    let recurse = match field.spec {
                        RecursionSpec::Flat => false,
                        RecursionSpec::Recursive => true,
                        RecursionSpec::Default => recursive,
                    };
                    if recurse {
                        value = self.format_value(&value, true, depth + 1)?;
                    }
                    out.push_str(&value.to_string());
                }
            }
        }
        Ok(Value::String(out))
    }
}

fn wrong_type(label: &str, expected: &str, found: &Value) -> StepwiseError {
    ContextError::WrongType {
        key: label.to_string(),
        expected: expected.to_string(),
        found: found.type_name().to_string(),
        caller: label.to_string(),
    }
    .into()
}
