//! Module: one pipeline step.
//!
//! A module binds a connector to its slice of the flow definition and drives
//! the connector lifecycle in three phases. `process_before` resolves the
//! connection, connects and prepares the action; `process` moves the data;
//! `process_after` commits or rolls back and closes the connector, and runs
//! whether or not the earlier phases succeeded.
//!
//! When the definition names a `PIPE` target the middle phase is replaced by
//! the flow-driven partial loop: `produce_partially` on this module feeds
//! `consume_partially` on the joined one until a batch comes back empty.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::connector::{ConnectInfo, Connector, ModuleContext, ProgressHandle};
use crate::constants::{flow_tags, payload_tags};
use crate::core::EngineServices;
use crate::error::{Result, SluiceError};
use crate::meta::record_data;
use crate::rule::MappingRule;
use crate::stream::{InputStream, Record, RecordPipe, StreamNext};
use crate::template::{CustomTemplate, DocumentTemplate};

use super::context::FlowContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Action {
    #[serde(rename = "CHECK")]
    Check,
    #[serde(rename = "COUNT")]
    Count,
    #[serde(rename = "READ")]
    Read,
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "DELETE")]
    Delete,
}

/// Connection reference: a datasource name or an inline definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConnectRef {
    Name(String),
    Inline(Value),
}

/// The typed slice of a module definition the driver itself consumes.
/// Backend-specific tags (TARGET, SQL, ...) stay in the raw definition and
/// are read by the connector.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleConfig {
    #[serde(rename = "ACTION")]
    pub action: Action,
    #[serde(rename = "CONNECT", default)]
    pub connect: Option<ConnectRef>,
    #[serde(rename = "RULE", default)]
    pub rule: Option<String>,
    #[serde(rename = "TEMPLATE", default)]
    pub template: Option<String>,
    #[serde(rename = "CALL", default)]
    pub call: Option<String>,
    #[serde(rename = "PIPE", default)]
    pub pipe: Option<String>,
    #[serde(rename = "RESULT", default)]
    pub result: Option<String>,
    #[serde(rename = "BATCHSIZE", default)]
    pub batch_size: Option<u64>,
    #[serde(rename = "BUFFERSIZE", default)]
    pub buffer_size: Option<u64>,
}

pub struct Module {
    pub name: String,
    pub config: ModuleConfig,
    definition: Value,
    rule: MappingRule,
    connector: Option<Box<dyn Connector>>,
    module_ctx: Option<ModuleContext>,
    /// Rows accepted but not yet pushed, bounded by the batch size.
    pending: Vec<Record>,
    pub result: Option<String>,
    pub message: String,
}

impl Module {
    pub fn new(name: impl Into<String>, definition: Value) -> Result<Self> {
        let name = name.into();
        let config: ModuleConfig = serde_json::from_value(definition.clone()).map_err(|e| {
            SluiceError::Config(format!("bad module definition for {name}: {e}"))
        })?;
        Ok(Self {
            name,
            config,
            definition,
            rule: MappingRule::new(),
            connector: None,
            module_ctx: None,
            pending: Vec::new(),
            result: None,
            message: String::new(),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size.map(|v| v.max(1) as usize).unwrap_or(1)
    }

    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size.map(|v| v.max(1) as usize).unwrap_or(64)
    }

    /// Operation timeout in seconds, when the definition sets one.
    pub fn timeout(&self) -> Option<u64> {
        self.definition.get(flow_tags::TIMEOUT).and_then(Value::as_u64)
    }

    /// Records pushed by the connector in this activation.
    pub fn sent(&self) -> u64 {
        self.connector.as_ref().map(|c| c.sent()).unwrap_or(0)
    }

    /// Subject document for lifecycle events about this module.
    pub fn subject(&self, flow_id: &str) -> Value {
        json!({
            "FLOW_ID": flow_id,
            "MODULE": self.name,
            "RESULT": self.result,
            "MSG": self.message,
        })
    }

    fn connector_and_ctx(&mut self) -> Result<(&mut Box<dyn Connector>, &ModuleContext)> {
        match (self.connector.as_mut(), self.module_ctx.as_ref()) {
            (Some(connector), Some(ctx)) => Ok((connector, ctx)),
            _ => Err(SluiceError::Logic(format!(
                "module {} is not connected",
                self.name
            ))),
        }
    }

    // &mut keeps the futures spawnable: a shared borrow held across the
    // await would require the boxed connector to be Sync
    async fn resolve_connect_info(
        &mut self,
        services: &EngineServices,
    ) -> Result<ConnectInfo> {
        let connect = self.config.connect.clone().ok_or_else(|| {
            SluiceError::Config(format!("module {} has no CONNECT", self.name))
        })?;
        let value = match connect {
            ConnectRef::Inline(v) => v,
            ConnectRef::Name(name) => {
                let table = &services.config.datasource_table;
                let record = services.meta.read(table, &name).await?.ok_or_else(|| {
                    SluiceError::Config(format!("datasource {name} not found"))
                })?;
                record_data(&record)
                    .cloned()
                    .ok_or_else(|| SluiceError::Config(format!("datasource {name} has no DATA")))?
            }
        };
        ConnectInfo::parse(&value, services.secrets.as_ref())
    }

    async fn resolve_template(
        &mut self,
        services: &EngineServices,
    ) -> Result<Option<Arc<dyn DocumentTemplate>>> {
        let Some(name) = &self.config.template else {
            return Ok(None);
        };
        let table = &services.config.template_table;
        let record = services
            .meta
            .read(table, name)
            .await?
            .ok_or_else(|| SluiceError::Config(format!("template {name} not found")))?;
        let text = record_data(&record)
            .and_then(|d| d.get("TEMPLATE"))
            .and_then(Value::as_str)
            .ok_or_else(|| SluiceError::Config(format!("template {name} has no TEMPLATE text")))?;
        Ok(Some(Arc::new(CustomTemplate::parse(text)?)))
    }

    /// Phase 1: connect and prepare the action. CHECK, COUNT and DELETE run
    /// to completion here; READ and CREATE only run their prepare step.
    pub async fn process_before(
        &mut self,
        services: &EngineServices,
        flow_ctx: &mut FlowContext,
    ) -> Result<()> {
        let connect_info = self.resolve_connect_info(services).await?;
        let mut connector = services.connectors.create(&connect_info.connector)?;
        let template = self.resolve_template(services).await?;

        self.rule = self
            .config
            .rule
            .as_ref()
            .and_then(|name| flow_ctx.rule(name))
            .cloned()
            .unwrap_or_default();

        let subject = json!({ "FLOW_ID": flow_ctx.id, "MODULE": self.name });
        // FETCHSIZE throttles progress events to every N rows
        let fetch_size = self
            .definition
            .get(flow_tags::FETCHSIZE)
            .and_then(Value::as_u64)
            .unwrap_or(1);
        let module_ctx = ModuleContext {
            module_name: self.name.clone(),
            sequence: self.definition.clone(),
            connect_info,
            context: flow_ctx.context_snapshot(),
            progress: ProgressHandle::with_threshold(services.handlers.clone(), subject, fetch_size),
            template,
        };

        connector.connect(&module_ctx).await?;

        // store the session first so process_after can close it even when
        // the prepare step below fails
        let outcome = prepare_action(
            self.config.action,
            &self.name,
            connector.as_mut(),
            &module_ctx,
            &self.rule,
        )
        .await;
        self.connector = Some(connector);
        self.module_ctx = Some(module_ctx);

        if let Some(message) = outcome? {
            self.message = message;
        }
        Ok(())
    }

    /// Phase 2: move the data. Skipped by the flow when a pipe target is set.
    pub async fn process(&mut self, flow_ctx: &mut FlowContext) -> Result<()> {
        match self.config.action {
            Action::Read => {
                let rule = self.rule.clone();
                let (connector, ctx) = self.connector_and_ctx()?;
                let records = connector.read(ctx, &rule).await?;
                connector.after_read(ctx).await?;

                if self.config.result.as_deref() == Some("BYPASS") {
                    // terminal result: hand the whole document downstream
                    let doc = json!({
                        payload_tags::HEADER: Value::Null,
                        payload_tags::ITEMS: records,
                    });
                    flow_ctx.set_stream(Some(Arc::new(InputStream::single(doc))));
                } else if self.config.call.is_some() {
                    let pipe =
                        RecordPipe::with_buffer_size(None, records, self.buffer_size());
                    flow_ctx.set_stream(Some(Arc::new(InputStream::shared(Box::new(pipe)))));
                } else {
                    flow_ctx.set_stream(None);
                }
            }
            Action::Create => {
                if let Some(stream) = flow_ctx.stream() {
                    let mut payload = stream.subscribe();
                    loop {
                        match stream.next(&mut payload)? {
                            StreamNext::Chunk(chunk) => {
                                let records = chunk.records().ok_or_else(|| {
                                    SluiceError::Logic(format!(
                                        "module {} received a binary chunk",
                                        self.name
                                    ))
                                })?;
                                self.pending.extend_from_slice(records);
                                self.flush_batches(false).await?;
                            }
                            StreamNext::Finished => break,
                            StreamNext::NotReady => {
                                return Err(SluiceError::Logic(format!(
                                    "stream not ready for module {}, another consumer owes a next() call",
                                    self.name
                                )));
                            }
                        }
                    }
                    self.flush_batches(true).await?;
                    stream.unsubscribe(payload);
                    flow_ctx.set_stream(None);
                } else {
                    self.flush_batches(true).await?;
                }
                let rule = self.rule.clone();
                let (connector, ctx) = self.connector_and_ctx()?;
                connector.after_create(ctx, &rule).await?;
            }
            Action::Check | Action::Count | Action::Delete => {}
        }
        Ok(())
    }

    /// Push complete batches; with `all` the remainder goes out too.
    async fn flush_batches(&mut self, all: bool) -> Result<()> {
        let batch_size = self.batch_size();
        loop {
            let batch: Vec<Record> = if self.pending.len() >= batch_size {
                self.pending.drain(..batch_size).collect()
            } else if all && !self.pending.is_empty() {
                self.pending.drain(..).collect()
            } else {
                break;
            };
            let rule = self.rule.clone();
            let (connector, ctx) = self.connector_and_ctx()?;
            connector.create(ctx, &rule, &batch).await?;
        }
        Ok(())
    }

    /// Pipe source side: fetch up to one buffer of records.
    pub async fn produce_partially(&mut self) -> Result<Vec<Record>> {
        let limit = self.buffer_size();
        let rule = self.rule.clone();
        let (connector, ctx) = self.connector_and_ctx()?;
        connector.read_partially(ctx, &rule, limit).await
    }

    pub async fn finish_produce(&mut self) -> Result<()> {
        let (connector, ctx) = self.connector_and_ctx()?;
        connector.after_read(ctx).await
    }

    /// Pipe sink side: accept one batch from the joined module.
    pub async fn consume_partially(&mut self, batch: &[Record]) -> Result<()> {
        self.pending.extend_from_slice(batch);
        self.flush_batches(false).await
    }

    pub async fn finish_consume(&mut self) -> Result<()> {
        self.flush_batches(true).await?;
        let rule = self.rule.clone();
        let (connector, ctx) = self.connector_and_ctx()?;
        connector.after_create(ctx, &rule).await
    }

    /// Phase 3: commit or roll back, then close. Always runs; the close
    /// happens even when the finalization itself fails.
    pub async fn process_after(&mut self, success: bool) -> Result<()> {
        let outcome = match self.connector_and_ctx() {
            Ok((connector, ctx)) => {
                if success {
                    connector.commit().await
                } else {
                    connector.rollback(ctx).await
                }
            }
            Err(_) => Ok(()),
        };

        if let Some(connector) = self.connector.as_mut() {
            if let Err(e) = connector.close().await {
                tracing::warn!(module = %self.name, error = %e, "connector close failed");
            }
        }

        self.result = Some(if success { "success" } else { "fail" }.to_string());
        outcome
    }
}

/// Dispatch the prepare step of one action. CHECK, COUNT and DELETE run to
/// completion; READ and CREATE defer the data movement to phase 2. Returns
/// an optional module message (the count, for COUNT).
async fn prepare_action(
    action: Action,
    name: &str,
    connector: &mut dyn Connector,
    ctx: &ModuleContext,
    rule: &MappingRule,
) -> Result<Option<String>> {
    match action {
        Action::Check => {
            if !connector.check(ctx).await? {
                return Err(SluiceError::Config(format!(
                    "target missing for module {name}"
                )));
            }
            Ok(None)
        }
        Action::Count => {
            let count = connector.count(ctx).await?;
            ctx.progress.report(count);
            Ok(Some(count.to_string()))
        }
        Action::Delete => {
            connector.delete(ctx).await?;
            Ok(None)
        }
        Action::Read => {
            connector.before_read(ctx, rule).await?;
            Ok(None)
        }
        Action::Create => {
            connector.before_create(ctx, rule).await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn module_config_parses_uppercase_tags() {
        let module = Module::new(
            "M1",
            json!({
                "ACTION": "CREATE",
                "CONNECT": "DS_OUT",
                "RULE": "R1",
                "CALL": "M2",
                "BATCHSIZE": 100,
                "TARGET": "TB_OUT",
            }),
        )
        .unwrap();
        assert_eq!(module.config.action, Action::Create);
        assert!(matches!(module.config.connect, Some(ConnectRef::Name(ref n)) if n == "DS_OUT"));
        assert_eq!(module.config.call.as_deref(), Some("M2"));
        assert_eq!(module.batch_size(), 100);
        assert_eq!(module.buffer_size(), 64);
    }

    #[test]
    fn inline_connect_is_accepted() {
        let module = Module::new(
            "M1",
            json!({
                "ACTION": "READ",
                "CONNECT": { "CONNECTOR": "FILE", "URL": "/tmp" },
            }),
        )
        .unwrap();
        assert!(matches!(module.config.connect, Some(ConnectRef::Inline(_))));
    }

    #[test]
    fn missing_action_is_rejected() {
        assert!(Module::new("M1", json!({ "CONNECT": "DS" })).is_err());
    }
}
