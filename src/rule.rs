//! Per-field mapping rules.
//!
//! A rule is an ordered list of `target: source` items parsed from a flow
//! definition. The first character of the source expression selects the
//! action:
//!
//! * `{path}` - system: resolve a dotted path against the module context
//! * `>NAME`  - function: evaluated by the connector's function processor
//! * `+expr`  - literal: verbatim text, `$col$` references substituted per row
//! * `#name`  - order: the running record number
//! * anything else - reference: copy the named source column
//!
//! Either side may carry a type tag (`NAME:DATE:%Y%m%d`); dates and numbers
//! are coerced between source and target representations. `=` mirrors the
//! opposite side's name.

use serde_json::Value;

use crate::context::Context;
use crate::error::{Result, SluiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    System,
    Reference,
    Literal,
    Function,
    Order,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleType {
    #[default]
    Any,
    String,
    Number,
    Date,
}

impl RuleType {
    fn parse(tag: &str) -> RuleType {
        match tag.trim().to_uppercase().as_str() {
            "STRING" => RuleType::String,
            "NUMBER" => RuleType::Number,
            "DATE" => RuleType::Date,
            _ => RuleType::Any,
        }
    }
}

/// One `target: source` mapping item.
#[derive(Debug, Clone)]
pub struct MappingRuleItem {
    pub source_name: String,
    pub source_type: RuleType,
    pub source_format: String,
    pub target_name: String,
    pub target_type: RuleType,
    pub target_format: String,
    pub action: RuleAction,
}

impl MappingRuleItem {
    pub fn new(target: &str, source: &str) -> Self {
        let (mut source_name, source_type, source_format) = split_typed(source);
        let (mut target_name, target_type, target_format) = split_typed(target);

        let action = match source_name.chars().next() {
            Some('{') => RuleAction::System,
            Some('>') => {
                source_name.remove(0);
                RuleAction::Function
            }
            Some('+') => {
                source_name.remove(0);
                RuleAction::Literal
            }
            Some('#') => {
                source_name.remove(0);
                RuleAction::Order
            }
            _ => RuleAction::Reference,
        };

        if source_name == "=" {
            source_name = target_name.clone();
        }
        if target_name == "=" {
            target_name = source_name.clone();
        }

        Self {
            source_name,
            source_type,
            source_format,
            target_name,
            target_type,
            target_format,
            action,
        }
    }
}

fn split_typed(expr: &str) -> (String, RuleType, String) {
    let mut parts = expr.splitn(3, ':');
    let name = parts.next().unwrap_or_default().trim().to_string();
    let ty = parts.next().map(RuleType::parse).unwrap_or_default();
    let format = parts.next().unwrap_or_default().trim().to_string();
    (name, ty, format)
}

/// Where a prepared-statement parameter takes its value from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamSource {
    /// A source column of the current record.
    Column(String),
    /// A dotted path into the module context.
    Context(String),
    /// A connector-evaluated function name.
    Function(String),
    /// The running record number.
    Order,
}

/// Evaluates engine functions (`>DATE`, `>SEQ`, ...) for a specific backend.
pub trait FunctionProcessor: Send + Sync {
    fn process(&self, item: &MappingRuleItem) -> Option<Value>;
}

/// Ordered mapping rule.
#[derive(Debug, Clone, Default)]
pub struct MappingRule {
    items: Vec<MappingRuleItem>,
}

impl MappingRule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `target -> source` pairs in iteration order.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let items = pairs
            .into_iter()
            .map(|(target, source)| MappingRuleItem::new(target, source))
            .collect();
        Self { items }
    }

    pub fn items(&self) -> &[MappingRuleItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Parameter sources for the placeholders a SQL header renders, in
    /// placeholder order. Literal items render inline and bind nothing.
    pub fn params(&self) -> Vec<ParamSource> {
        self.items
            .iter()
            .filter_map(|item| match item.action {
                RuleAction::Reference => Some(ParamSource::Column(item.source_name.clone())),
                RuleAction::System => Some(ParamSource::Context(strip_braces(&item.source_name))),
                RuleAction::Function => Some(ParamSource::Function(item.source_name.clone())),
                RuleAction::Order => Some(ParamSource::Order),
                RuleAction::Literal => None,
            })
            .collect()
    }

    /// Evaluate one item against a record.
    ///
    /// `seq` is the running record number used by order items; `functions`
    /// resolves function items and may be absent (yields null).
    pub fn apply(
        &self,
        item: &MappingRuleItem,
        row: &serde_json::Map<String, Value>,
        ctx: &Context,
        functions: Option<&dyn FunctionProcessor>,
        seq: u64,
    ) -> Result<Value> {
        let raw = match item.action {
            RuleAction::System => ctx
                .get(&strip_braces(&item.source_name))
                .and_then(|v| v.as_json().cloned())
                .unwrap_or(Value::Null),
            RuleAction::Reference => row.get(&item.source_name).cloned().unwrap_or(Value::Null),
            RuleAction::Literal => Value::String(substitute_columns(&item.source_name, row)),
            RuleAction::Function => functions
                .and_then(|f| f.process(item))
                .unwrap_or(Value::Null),
            RuleAction::Order => Value::from(seq),
        };

        coerce(raw, item)
    }
}

fn strip_braces(name: &str) -> String {
    name.trim_start_matches('{').trim_end_matches('}').to_string()
}

/// Replace `$col$` references in a literal expression with record values.
fn substitute_columns(expr: &str, row: &serde_json::Map<String, Value>) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut rest = expr;
    while let Some(open) = rest.find('$') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('$') {
            Some(close) if close > 0 => {
                let col = &after[..close];
                match row.get(col) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(v) => out.push_str(&v.to_string()),
                    None => {
                        out.push('$');
                        out.push_str(col);
                        out.push('$');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('$');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Coerce a value between declared source and target types.
fn coerce(value: Value, item: &MappingRuleItem) -> Result<Value> {
    match item.target_type {
        RuleType::Date => {
            let text = match &value {
                Value::String(s) => s.clone(),
                Value::Null => return Ok(Value::Null),
                v => v.to_string(),
            };
            let source_format = if item.source_format.is_empty() {
                "%Y-%m-%d %H:%M:%S"
            } else {
                &item.source_format
            };
            let target_format = if item.target_format.is_empty() {
                "%Y-%m-%d %H:%M:%S"
            } else {
                &item.target_format
            };
            let parsed = chrono::NaiveDateTime::parse_from_str(&text, source_format)
                .or_else(|_| {
                    chrono::NaiveDate::parse_from_str(&text, source_format)
                        .map(|d| d.and_time(chrono::NaiveTime::MIN))
                })
                .map_err(|e| {
                    SluiceError::Config(format!(
                        "cannot parse '{text}' with format '{source_format}': {e}"
                    ))
                })?;
            Ok(Value::String(parsed.format(target_format).to_string()))
        }
        RuleType::Number => match &value {
            Value::Number(_) | Value::Null => Ok(value),
            Value::String(s) => {
                let trimmed = s.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    Ok(Value::from(i))
                } else {
                    let f = trimmed.parse::<f64>().map_err(|e| {
                        SluiceError::Config(format!("cannot parse '{s}' as number: {e}"))
                    })?;
                    Ok(Value::from(f))
                }
            }
            v => Err(SluiceError::Config(format!("cannot coerce {v} to number"))),
        },
        RuleType::String => match value {
            Value::String(_) | Value::Null => Ok(value),
            v => Ok(Value::String(v.to_string())),
        },
        RuleType::Any => Ok(value),
    }
}
