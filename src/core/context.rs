//! Path-addressed access to the execution context.
//!
//! The context is a plain `serde_json::Value` tree. Paths use dotted keys
//! with optional bracketed indices (`a.b[0].c`); numeric dotted segments
//! (`a.0`) index into arrays as well. Templates come in two flavours:
//! a whole-string `{{path}}` yields the raw value (type preserved), while
//! `${path}` occurrences inside a longer string are replaced by the value's
//! text form.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

use crate::core::errors::{PlanError, Result};

lazy_static! {
    static ref WHOLE_TEMPLATE: Regex = Regex::new(r"^\{\{\s*([^{}]+?)\s*\}\}$").unwrap();
    static ref INLINE_TEMPLATE: Regex = Regex::new(r"\$\{\s*([^{}]+?)\s*\}").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Splits `a.b[0].c` into segments. Returns `None` for malformed paths
/// (unbalanced brackets, non-numeric indices, empty segments).
pub fn parse_path(path: &str) -> Option<Vec<PathSegment>> {
    let path = path.trim();
    if path.is_empty() {
        return Some(Vec::new());
    }

    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return None;
        }
        let (head, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !head.is_empty() {
            segments.push(PathSegment::Key(head.to_string()));
        }
        while !rest.is_empty() {
            let close = rest.find(']')?;
            if !rest.starts_with('[') {
                return None;
            }
            let index = rest[1..close].trim().parse::<usize>().ok()?;
            segments.push(PathSegment::Index(index));
            rest = &rest[close + 1..];
        }
    }
    Some(segments)
}

fn step_into<'a>(current: &'a Value, segment: &PathSegment) -> Option<&'a Value> {
    match (current, segment) {
        (Value::Object(map), PathSegment::Key(key)) => map.get(key),
        (Value::Array(items), PathSegment::Index(i)) => items.get(*i),
        (Value::Array(items), PathSegment::Key(key)) => {
            if key == "length" {
                return None;
            }
            key.parse::<usize>().ok().and_then(|i| items.get(i))
        }
        _ => None,
    }
}

/// Reads the value at `path`. Missing intermediates yield `None`, never an error.
pub fn resolve<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse_path(path)?;
    let mut current = ctx;
    for segment in &segments {
        current = step_into(current, segment)?;
    }
    Some(current)
}

fn empty_container_for(next: Option<&PathSegment>) -> Value {
    match next {
        Some(PathSegment::Index(_)) => Value::Array(Vec::new()),
        _ => Value::Object(Map::new()),
    }
}

/// Largest array index a write may create; reads are not limited.
pub const MAX_WRITE_INDEX: usize = 100_000;

fn slot_mut<'a>(
    current: &'a mut Value,
    segment: &PathSegment,
    next: Option<&PathSegment>,
) -> Result<&'a mut Value> {
    let index = match segment {
        PathSegment::Index(i) => Some(*i),
        PathSegment::Key(key) if current.is_array() => key.parse::<usize>().ok(),
        PathSegment::Key(_) => None,
    };

    match (index, segment) {
        (Some(i), _) => {
            if !current.is_array() {
                *current = Value::Array(Vec::new());
            }
            let items = match current {
                Value::Array(items) => items,
                _ => unreachable!("container was just replaced by an array"),
            };
            if items.len() <= i {
                let len = i
                    .checked_add(1)
                    .filter(|len| *len <= MAX_WRITE_INDEX + 1)
                    .ok_or_else(|| {
                        PlanError::InvalidPath(format!(
                            "array index {} exceeds the write limit of {}",
                            i, MAX_WRITE_INDEX
                        ))
                    })?;
                items.resize(len, Value::Null);
            }
            let slot = &mut items[i];
            if next.is_some() && !is_container(slot) {
                *slot = empty_container_for(next);
            }
            Ok(slot)
        }
        (None, PathSegment::Key(key)) => {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            let map = match current {
                Value::Object(map) => map,
                _ => unreachable!("container was just replaced by an object"),
            };
            let slot = map.entry(key.clone()).or_insert(Value::Null);
            if next.is_some() && !is_container(slot) {
                *slot = empty_container_for(next);
            }
            Ok(slot)
        }
        (None, PathSegment::Index(_)) => unreachable!("index segments always carry an index"),
    }
}

fn is_container(value: &Value) -> bool {
    value.is_object() || value.is_array()
}

/// Writes `value` at `path`, creating intermediate objects/arrays as needed and
/// replacing any scalar that sits where a container is required.
pub fn set_path(ctx: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments =
        parse_path(path).ok_or_else(|| PlanError::InvalidPath(path.to_string()))?;
    if segments.is_empty() {
        return Err(PlanError::InvalidPath("empty path".to_string()));
    }

    let mut current = ctx;
    for (i, segment) in segments.iter().enumerate() {
        current = slot_mut(current, segment, segments.get(i + 1))?;
    }
    *current = value;
    Ok(())
}

/// Structural copy through a serde round-trip. On failure the original is
/// cloned as-is and a warning is logged.
pub fn deep_clone<T>(value: &T) -> T
where
    T: Serialize + DeserializeOwned + Clone,
{
    match serde_json::to_value(value).and_then(serde_json::from_value) {
        Ok(copy) => copy,
        Err(e) => {
            warn!(error = %e, "Deep clone round-trip failed, falling back to plain clone");
            value.clone()
        }
    }
}

/// Text form used for `${path}` interpolation; null and missing values become "".
pub fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Expands `${path}` occurrences inside a string.
pub fn interpolate(text: &str, ctx: &Value) -> String {
    INLINE_TEMPLATE
        .replace_all(text, |caps: &Captures| stringify(resolve(ctx, &caps[1])))
        .into_owned()
}

/// If `text` is exactly `{{path}}`, returns the path.
pub fn whole_template_path(text: &str) -> Option<&str> {
    WHOLE_TEMPLATE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Recursively substitutes templates in strings, array elements and object
/// values. Object keys are left untouched.
pub fn substitute(template: &Value, ctx: &Value) -> Value {
    match template {
        Value::String(text) => match whole_template_path(text) {
            Some(path) => resolve(ctx, path).cloned().unwrap_or(Value::Null),
            None => Value::String(interpolate(text, ctx)),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolves a collection reference: a `{{path}}` template, a bare path, or an
/// inline array literal.
pub fn resolve_reference(reference: &Value, ctx: &Value) -> Option<Value> {
    match reference {
        Value::String(text) => match whole_template_path(text) {
            Some(path) => resolve(ctx, path).cloned(),
            None => resolve(ctx, text).cloned(),
        },
        Value::Array(_) => Some(substitute(reference, ctx)),
        _ => None,
    }
}

/// Returns a copy of `ctx` with `name` bound to `value` at the top level.
pub fn with_binding(ctx: &Value, name: &str, value: Value) -> Value {
    let mut scoped = match ctx {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    scoped.insert(name.to_string(), value);
    Value::Object(scoped)
}

/// The execution context shared by every node of one run.
///
/// Writes are last-write-wins; the lock is only held for the duration of a
/// single read or write and never across an await point.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    inner: Arc<RwLock<Value>>,
}

impl SharedContext {
    pub fn new(initial: Value) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn snapshot(&self) -> Value {
        self.inner.read().clone()
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        resolve(&self.inner.read(), path).cloned()
    }

    pub fn set(&self, path: &str, value: Value) -> Result<()> {
        set_path(&mut self.inner.write(), path, value)
    }

    pub fn substitute(&self, template: &Value) -> Value {
        substitute(template, &self.inner.read())
    }

    pub fn into_value(self) -> Value {
        match Arc::try_unwrap(self.inner) {
            Ok(lock) => lock.into_inner(),
            Err(shared) => shared.read().clone(),
        }
    }
}
