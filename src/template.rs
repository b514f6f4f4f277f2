//! Document templates: render outgoing records into header, body and footer
//! text.
//!
//! File-style connectors render each pushed buffer through a template. The
//! header is written once before the first record, the body once per record
//! batch, the footer after the source is exhausted. A SQL template renders a
//! prepared-statement header instead; its placeholders line up with
//! [`MappingRule::params`] so the connector can bind values per record.

use serde_json::Value;

use crate::context::Context;
use crate::error::{Result, SluiceError};
use crate::rule::{FunctionProcessor, MappingRule, RuleAction};
use crate::stream::Record;

/// Renders records into an output document.
pub trait DocumentTemplate: Send + Sync {
    /// Text written once before the first record.
    fn make_header(&self, ctx: &Context, rule: &MappingRule) -> Result<String>;

    /// Text for one batch of records. `start_index` is the running record
    /// number of the first item, so batches join correctly.
    fn make_body(
        &self,
        ctx: &Context,
        rule: &MappingRule,
        items: &[Record],
        functions: Option<&dyn FunctionProcessor>,
        start_index: u64,
    ) -> Result<String>;

    /// Text written once after the last record.
    fn make_footer(&self, ctx: &Context, rule: &MappingRule) -> Result<String>;
}

/// Apply every rule item to one record, producing the outgoing object.
fn project(
    rule: &MappingRule,
    row: &Record,
    ctx: &Context,
    functions: Option<&dyn FunctionProcessor>,
    seq: u64,
) -> Result<Record> {
    let mut out = Record::new();
    if rule.is_empty() {
        return Ok(row.clone());
    }
    for item in rule.items() {
        let value = rule.apply(item, row, ctx, functions, seq)?;
        out.insert(item.target_name.clone(), value);
    }
    Ok(out)
}

/// Renders a JSON array document, one object per record.
#[derive(Debug, Default)]
pub struct JsonTemplate;

impl DocumentTemplate for JsonTemplate {
    fn make_header(&self, _ctx: &Context, _rule: &MappingRule) -> Result<String> {
        Ok("[\n".to_string())
    }

    fn make_body(
        &self,
        ctx: &Context,
        rule: &MappingRule,
        items: &[Record],
        functions: Option<&dyn FunctionProcessor>,
        start_index: u64,
    ) -> Result<String> {
        let mut out = String::new();
        for (i, row) in items.iter().enumerate() {
            let seq = start_index + i as u64;
            if seq > 0 {
                out.push_str(",\n");
            }
            let projected = project(rule, row, ctx, functions, seq)?;
            out.push_str(&serde_json::to_string(&Value::Object(projected))?);
        }
        Ok(out)
    }

    fn make_footer(&self, _ctx: &Context, _rule: &MappingRule) -> Result<String> {
        Ok("\n]".to_string())
    }
}

/// Renders an `INSERT` statement header with positional placeholders.
///
/// Literal items render inline; everything else becomes a `$n` placeholder
/// in rule order, matching [`MappingRule::params`]. Body and footer are
/// empty, the connector executes the header per record.
#[derive(Debug)]
pub struct SqlTemplate {
    target: String,
}

impl SqlTemplate {
    pub fn new(target: impl Into<String>) -> Self {
        Self { target: target.into() }
    }
}

impl DocumentTemplate for SqlTemplate {
    fn make_header(&self, ctx: &Context, rule: &MappingRule) -> Result<String> {
        if rule.is_empty() {
            return Err(SluiceError::Config(format!(
                "insert into {} requires a mapping rule",
                self.target
            )));
        }
        let mut columns = Vec::with_capacity(rule.items().len());
        let mut values = Vec::with_capacity(rule.items().len());
        let mut placeholder = 0usize;
        for item in rule.items() {
            columns.push(item.target_name.clone());
            match item.action {
                RuleAction::Literal => {
                    values.push(ctx.evaluate(&item.source_name));
                }
                RuleAction::Order
                | RuleAction::Reference
                | RuleAction::System
                | RuleAction::Function => {
                    placeholder += 1;
                    values.push(format!("${placeholder}"));
                }
            }
        }
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.target,
            columns.join(", "),
            values.join(", ")
        ))
    }

    fn make_body(
        &self,
        _ctx: &Context,
        _rule: &MappingRule,
        _items: &[Record],
        _functions: Option<&dyn FunctionProcessor>,
        _start_index: u64,
    ) -> Result<String> {
        Ok(String::new())
    }

    fn make_footer(&self, _ctx: &Context, _rule: &MappingRule) -> Result<String> {
        Ok(String::new())
    }
}

/// Template defined as text in the metadata store.
///
/// The text is split into `#header`, `#body` and `#footer` sections, each
/// closed by `#end`. Context expressions (`{dotted.path}`) are substituted in
/// every section; the body additionally substitutes `$COLUMN$` with the
/// rule-applied value per record. A `delimiter=` attribute on the `#body` tag
/// joins consecutive records.
#[derive(Debug)]
pub struct CustomTemplate {
    header: String,
    body: String,
    body_delimiter: String,
    footer: String,
}

impl CustomTemplate {
    pub fn parse(text: &str) -> Result<Self> {
        let mut header = String::new();
        let mut body = String::new();
        let mut body_delimiter = String::new();
        let mut footer = String::new();

        let mut section: Option<&str> = None;
        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(tag) = trimmed.strip_prefix('#') {
                let mut parts = tag.split_whitespace();
                match parts.next() {
                    Some("header") => section = Some("header"),
                    Some("body") => {
                        section = Some("body");
                        for attr in parts {
                            if let Some(d) = attr.strip_prefix("delimiter=") {
                                body_delimiter = d.replace("\\n", "\n");
                            }
                        }
                    }
                    Some("footer") => section = Some("footer"),
                    Some("end") => section = None,
                    other => {
                        return Err(SluiceError::Config(format!(
                            "unknown template tag #{}",
                            other.unwrap_or_default()
                        )));
                    }
                }
                continue;
            }
            let target = match section {
                Some("header") => &mut header,
                Some("body") => &mut body,
                Some("footer") => &mut footer,
                _ => continue,
            };
            if !target.is_empty() {
                target.push('\n');
            }
            target.push_str(line);
        }

        Ok(Self {
            header,
            body,
            body_delimiter,
            footer,
        })
    }

    fn render_row(
        &self,
        ctx: &Context,
        rule: &MappingRule,
        row: &Record,
        functions: Option<&dyn FunctionProcessor>,
        seq: u64,
    ) -> Result<String> {
        let projected = project(rule, row, ctx, functions, seq)?;
        let mut out = ctx.evaluate(&self.body);
        for (name, value) in &projected {
            let needle = format!("${name}$");
            if out.contains(&needle) {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    v => v.to_string(),
                };
                out = out.replace(&needle, &text);
            }
        }
        Ok(out)
    }
}

impl DocumentTemplate for CustomTemplate {
    fn make_header(&self, ctx: &Context, _rule: &MappingRule) -> Result<String> {
        Ok(ctx.evaluate(&self.header))
    }

    fn make_body(
        &self,
        ctx: &Context,
        rule: &MappingRule,
        items: &[Record],
        functions: Option<&dyn FunctionProcessor>,
        start_index: u64,
    ) -> Result<String> {
        let mut out = String::new();
        for (i, row) in items.iter().enumerate() {
            let seq = start_index + i as u64;
            if seq > 0 {
                out.push_str(&self.body_delimiter);
            }
            out.push_str(&self.render_row(ctx, rule, row, functions, seq)?);
        }
        Ok(out)
    }

    fn make_footer(&self, ctx: &Context, _rule: &MappingRule) -> Result<String> {
        Ok(ctx.evaluate(&self.footer))
    }
}
