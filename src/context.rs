//! Hierarchical, string-keyed value tree shared by a request and its flows.
//!
//! A [`Context`] is a map whose entries are either plain JSON values or
//! nested child contexts. Lookup with a dotted path follows one documented
//! rule: the literal whole key is tried first, then the path is resolved
//! segment by segment, delegating the remaining path into child [`Context`]
//! nodes and walking through plain JSON objects.

use std::collections::HashMap;

use serde_json::Value;

/// One entry of a [`Context`]: a JSON value or a nested context.
#[derive(Debug, Clone)]
pub enum ContextValue {
    Json(Value),
    Context(Context),
}

/// Borrowed view of a resolved context entry.
#[derive(Debug, Clone, Copy)]
pub enum ValueRef<'a> {
    Json(&'a Value),
    Context(&'a Context),
}

impl<'a> ValueRef<'a> {
    pub fn as_json(&self) -> Option<&'a Value> {
        match self {
            ValueRef::Json(v) => Some(v),
            ValueRef::Context(_) => None,
        }
    }

    pub fn as_context(&self) -> Option<&'a Context> {
        match self {
            ValueRef::Context(c) => Some(c),
            ValueRef::Json(_) => None,
        }
    }
}

/// String-keyed value tree with dotted-path lookup.
///
/// Lifetime is one request or one flow invocation. Fanned-out jobs receive a
/// deep copy (`Context` is `Clone`); nothing here is shared across threads.
#[derive(Debug, Clone, Default)]
pub struct Context {
    map: HashMap<String, ContextValue>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a JSON value under `key`, replacing any previous entry.
    pub fn add(&mut self, key: impl Into<String>, value: Value) {
        self.map.insert(key.into(), ContextValue::Json(value));
    }

    /// Add a nested child context under `key`.
    pub fn add_context(&mut self, key: impl Into<String>, child: Context) {
        self.map.insert(key.into(), ContextValue::Context(child));
    }

    pub fn remove(&mut self, key: &str) -> Option<ContextValue> {
        self.map.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Resolve `key`, which may be a dotted path.
    ///
    /// The literal whole key wins over path descent, so an entry stored as
    /// `"A.B"` shadows the path `A` then `B`.
    pub fn get(&self, key: &str) -> Option<ValueRef<'_>> {
        if let Some(v) = self.map.get(key) {
            return Some(match v {
                ContextValue::Json(j) => ValueRef::Json(j),
                ContextValue::Context(c) => ValueRef::Context(c),
            });
        }

        let (head, rest) = key.split_once('.')?;
        match self.map.get(head)? {
            // A child context resolves the remaining path itself, which
            // re-applies the whole-key-first rule at that level.
            ContextValue::Context(child) => child.get(rest),
            ContextValue::Json(v) => json_descend(v, rest).map(ValueRef::Json),
        }
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            ValueRef::Json(Value::String(s)) => Some(s.clone()),
            ValueRef::Json(Value::Null) => None,
            ValueRef::Json(v) => Some(v.to_string()),
            ValueRef::Context(_) => None,
        }
    }

    pub fn get_string_default(&self, key: &str, default: &str) -> String {
        self.get_string(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            ValueRef::Json(Value::Number(n)) => n.as_i64(),
            ValueRef::Json(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_i64_default(&self, key: &str, default: i64) -> i64 {
        self.get_i64(key).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            ValueRef::Json(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Substitute every `{dotted.path}` occurrence in `input` with the value
    /// resolved from this context. Unresolvable expressions are left as-is
    /// and logged. Nested braces are not supported.
    pub fn evaluate(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close)
                    if close > 0
                        && !after[..close]
                            .contains(|c: char| c.is_whitespace() || c == '{') =>
                {
                    let expr = &after[..close];
                    match self.get_string(expr) {
                        Some(value) => out.push_str(&value),
                        None => {
                            tracing::error!(expr, "unresolvable context expression");
                            out.push('{');
                            out.push_str(expr);
                            out.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Serialize the whole tree into a JSON object; nested contexts become
    /// nested objects. Used for spool descriptors.
    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        for (k, v) in &self.map {
            let val = match v {
                ContextValue::Json(j) => j.clone(),
                ContextValue::Context(c) => c.to_json(),
            };
            obj.insert(k.clone(), val);
        }
        Value::Object(obj)
    }

    /// Like [`Context::to_json`] but omitting the listed top-level keys.
    pub fn to_json_without(&self, skip: &[&str]) -> Value {
        let mut obj = match self.to_json() {
            Value::Object(o) => o,
            _ => unreachable!(),
        };
        for key in skip {
            obj.remove(*key);
        }
        Value::Object(obj)
    }

    /// Rebuild a flat context from a JSON object; every entry becomes a plain
    /// JSON value, no child contexts are reconstructed.
    pub fn from_json(value: &Value) -> crate::error::Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| crate::error::SluiceError::Protocol("context is not an object".into()))?;
        let mut ctx = Context::new();
        for (k, v) in obj {
            ctx.add(k.clone(), v.clone());
        }
        Ok(ctx)
    }
}

fn json_descend<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}
