//! File backend.
//!
//! The connection URL is a base directory; the module target, after context
//! substitution, names the file inside it. CREATE renders records through
//! the document template into the file, READ parses a JSON document back
//! into records. Rollback removes the partially written file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::constants::payload_tags;
use crate::error::{Result, SluiceError};
use crate::rule::{FunctionProcessor, MappingRule, MappingRuleItem};
use crate::stream::Record;

use super::{Connector, ModuleContext};

struct FileFunctions {
    seq: AtomicU64,
}

impl FunctionProcessor for FileFunctions {
    fn process(&self, item: &MappingRuleItem) -> Option<Value> {
        match item.source_name.as_str() {
            "DATE" | "TARGET_DATE" => {
                let format = if item.target_format.is_empty() {
                    "%Y-%m-%d %H:%M:%S"
                } else {
                    &item.target_format
                };
                Some(Value::String(
                    chrono::Local::now().format(format).to_string(),
                ))
            }
            "SEQ" => Some(Value::from(self.seq.fetch_add(1, Ordering::Relaxed) + 1)),
            _ => None,
        }
    }
}

pub struct FileConnector {
    path: Option<PathBuf>,
    writer: Option<tokio::io::BufWriter<tokio::fs::File>>,
    /// Records loaded by `before_read`, drained by the read calls.
    buffered: Vec<Record>,
    sent: u64,
    retrieved: u64,
    functions: FileFunctions,
}

impl FileConnector {
    pub fn new() -> Self {
        Self {
            path: None,
            writer: None,
            buffered: Vec::new(),
            sent: 0,
            retrieved: 0,
            functions: FileFunctions {
                seq: AtomicU64::new(0),
            },
        }
    }

    fn path(&self) -> Result<&PathBuf> {
        self.path
            .as_ref()
            .ok_or_else(|| SluiceError::Connect("file connector is not connected".into()))
    }

    pub(crate) fn parse_records(doc: Value) -> Result<Vec<Record>> {
        let items = match doc {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove(payload_tags::ITEMS) {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(SluiceError::Protocol(
                        "file document carries no item list".into(),
                    ))
                }
            },
            _ => {
                return Err(SluiceError::Protocol(
                    "file document is neither an array nor an object".into(),
                ))
            }
        };
        items
            .into_iter()
            .map(|v| match v {
                Value::Object(o) => Ok(o),
                other => Err(SluiceError::Protocol(format!(
                    "file document item is not an object: {other}"
                ))),
            })
            .collect()
    }
}

impl Default for FileConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for FileConnector {
    async fn connect(&mut self, ctx: &ModuleContext) -> Result<()> {
        let base = PathBuf::from(&ctx.connect_info.url);
        self.path = Some(base.join(ctx.target()?));
        Ok(())
    }

    async fn check(&mut self, _ctx: &ModuleContext) -> Result<bool> {
        Ok(self.path()?.exists())
    }

    async fn count(&mut self, _ctx: &ModuleContext) -> Result<u64> {
        let raw = tokio::fs::read(self.path()?).await?;
        let doc: Value = serde_json::from_slice(&raw)?;
        Ok(Self::parse_records(doc)?.len() as u64)
    }

    async fn before_read(&mut self, _ctx: &ModuleContext, _rule: &MappingRule) -> Result<()> {
        let raw = tokio::fs::read(self.path()?).await?;
        let doc: Value = serde_json::from_slice(&raw)?;
        self.buffered = Self::parse_records(doc)?;
        self.retrieved = 0;
        Ok(())
    }

    async fn read(&mut self, ctx: &ModuleContext, _rule: &MappingRule) -> Result<Vec<Record>> {
        let records = std::mem::take(&mut self.buffered);
        self.retrieved += records.len() as u64;
        ctx.progress.report(self.retrieved);
        Ok(records)
    }

    async fn read_partially(
        &mut self,
        ctx: &ModuleContext,
        _rule: &MappingRule,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let take = limit.min(self.buffered.len());
        let records: Vec<Record> = self.buffered.drain(..take).collect();
        if !records.is_empty() {
            self.retrieved += records.len() as u64;
            ctx.progress.report(self.retrieved);
        }
        Ok(records)
    }

    async fn after_read(&mut self, _ctx: &ModuleContext) -> Result<()> {
        self.buffered.clear();
        Ok(())
    }

    async fn before_create(&mut self, ctx: &ModuleContext, rule: &MappingRule) -> Result<()> {
        let path = self.path()?.clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        let mut writer = tokio::io::BufWriter::new(file);

        let header = ctx.template().make_header(&ctx.context, rule)?;
        writer.write_all(header.as_bytes()).await?;
        self.writer = Some(writer);
        Ok(())
    }

    async fn create(
        &mut self,
        ctx: &ModuleContext,
        rule: &MappingRule,
        items: &[Record],
    ) -> Result<u64> {
        let body = ctx
            .template()
            .make_body(
                &ctx.context,
                rule,
                items,
                Some(&self.functions),
                self.sent,
            )
            .map_err(|e| match e {
                SluiceError::Data { position, reason } => SluiceError::Data {
                    position: self.sent as usize + position,
                    reason,
                },
                other => other,
            })?;

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SluiceError::Logic("create before before_create".into()))?;
        writer.write_all(body.as_bytes()).await?;

        self.sent += items.len() as u64;
        ctx.progress.report(self.sent);
        Ok(self.sent)
    }

    async fn after_create(&mut self, ctx: &ModuleContext, rule: &MappingRule) -> Result<()> {
        let footer = ctx.template().make_footer(&ctx.context, rule)?;
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(footer.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok(())
    }

    async fn delete(&mut self, _ctx: &ModuleContext) -> Result<u64> {
        let path = self.path()?;
        if path.exists() {
            tokio::fs::remove_file(path).await?;
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self, ctx: &ModuleContext) -> Result<()> {
        self.writer = None;
        let path = self.path()?;
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        self.sent = 0;
        ctx.progress.report(0);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
        }
        self.buffered.clear();
        Ok(())
    }

    fn sent(&self) -> u64 {
        self.sent
    }

    fn function_processor(&self) -> Option<&dyn FunctionProcessor> {
        Some(&self.functions)
    }
}
