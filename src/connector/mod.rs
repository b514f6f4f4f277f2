//! Connectors: pluggable backends behind module operations.
//!
//! A connector owns one session against a backend (file system, database,
//! FTP server) and exposes the operation lifecycle the module driver walks
//! through: `connect`, the action phases (`check`, `count`, read phases,
//! create phases, `delete`), then `commit`/`rollback` and `close`. Connectors
//! are created per module activation through the [`ConnectorFactory`] and
//! never shared.

mod db;
mod file;
mod ftp;

pub use db::{DbConnector, DbPools};
pub use file::FileConnector;
pub use ftp::FtpConnector;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::constants::{connector_tags, flow_tags};
use crate::context::Context;
use crate::error::{Result, SluiceError};
use crate::handler::{HandlerSet, LifecycleStep};
use crate::rule::{FunctionProcessor, MappingRule};
use crate::security::Secrets;
use crate::stream::Record;
use crate::template::DocumentTemplate;

/// Parsed connection info from a datasource definition.
///
/// The password field is decrypted on parse, before any connector sees it.
#[derive(Debug, Clone, Default)]
pub struct ConnectInfo {
    pub connector: String,
    pub url: String,
    pub user: String,
    pub password: String,
    pub dbtype: Option<String>,
    pub passive: bool,
    pub timeout: Option<u64>,
}

impl ConnectInfo {
    pub fn parse(value: &Value, secrets: &dyn Secrets) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| SluiceError::Config("connection info is not an object".into()))?;
        let text = |tag: &str| -> String {
            obj.get(tag)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let connector = text(connector_tags::CONNECTOR);
        if connector.is_empty() {
            return Err(SluiceError::Config(
                "connection info has no CONNECTOR field".into(),
            ));
        }

        let password = {
            let raw = text(connector_tags::PASSWORD);
            if raw.is_empty() {
                raw
            } else {
                secrets.decrypt(&raw)?
            }
        };

        Ok(Self {
            connector: connector.to_uppercase(),
            url: text(connector_tags::URL),
            user: text(connector_tags::USER),
            password,
            dbtype: obj
                .get(connector_tags::DBTYPE)
                .and_then(Value::as_str)
                .map(str::to_string),
            passive: obj
                .get(connector_tags::PASSIVE)
                .and_then(Value::as_bool)
                .unwrap_or(true),
            timeout: obj.get(connector_tags::TIMEOUT).and_then(Value::as_u64),
        })
    }
}

/// Progress reporting for one module activation.
///
/// Holds the running sent/retrieved count and pushes `MODULE_PROGRESS`
/// lifecycle events with the count attached. With a threshold above one
/// (the module's FETCHSIZE tag) an event only fires when the count crosses
/// the next threshold multiple; a reset to zero always fires.
#[derive(Clone)]
pub struct ProgressHandle {
    handlers: Arc<HandlerSet>,
    subject: Value,
    progress: Arc<AtomicU64>,
    reported: Arc<AtomicU64>,
    threshold: u64,
}

impl ProgressHandle {
    pub fn new(handlers: Arc<HandlerSet>, subject: Value) -> Self {
        Self::with_threshold(handlers, subject, 1)
    }

    pub fn with_threshold(handlers: Arc<HandlerSet>, subject: Value, threshold: u64) -> Self {
        Self {
            handlers,
            subject,
            progress: Arc::new(AtomicU64::new(0)),
            reported: Arc::new(AtomicU64::new(0)),
            threshold: threshold.max(1),
        }
    }

    /// Handle that reports nowhere, for tests and detached runs.
    pub fn disabled() -> Self {
        Self::new(Arc::new(HandlerSet::new()), Value::Null)
    }

    pub fn report(&self, progress: u64) {
        self.progress.store(progress, Ordering::Relaxed);
        let last = self.reported.swap(progress, Ordering::Relaxed);
        if progress != 0 && progress / self.threshold == last / self.threshold {
            return;
        }
        let mut subject = self.subject.clone();
        if let Some(obj) = subject.as_object_mut() {
            obj.insert("PROGRESS".to_string(), Value::from(progress));
        }
        self.handlers.handle(LifecycleStep::ModuleProgress, &subject);
    }

    pub fn current(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }
}

/// Everything a connector may consult while serving one module activation.
pub struct ModuleContext {
    pub module_name: String,
    /// The module definition document (TARGET, BATCHSIZE, SQL, ...).
    pub sequence: Value,
    pub connect_info: ConnectInfo,
    /// Snapshot of the flow context at activation time.
    pub context: Context,
    pub progress: ProgressHandle,
    pub template: Option<Arc<dyn DocumentTemplate>>,
}

impl ModuleContext {
    fn sequence_str(&self, tag: &str) -> Option<&str> {
        self.sequence.get(tag).and_then(Value::as_str)
    }

    /// The module target with context expressions substituted.
    pub fn target(&self) -> Result<String> {
        let raw = self.sequence_str(flow_tags::TARGET).ok_or_else(|| {
            SluiceError::Config(format!("module {} has no TARGET", self.module_name))
        })?;
        Ok(self.context.evaluate(raw))
    }

    pub fn sql(&self) -> Option<String> {
        self.sequence_str(flow_tags::SQL)
            .map(|s| self.context.evaluate(s))
    }

    pub fn condition(&self) -> Option<String> {
        self.sequence_str(flow_tags::CONDITION)
            .map(|s| self.context.evaluate(s))
    }

    pub fn batch_size(&self) -> usize {
        self.sequence
            .get(flow_tags::BATCHSIZE)
            .and_then(Value::as_u64)
            .map(|v| v.max(1) as usize)
            .unwrap_or(1)
    }

    pub fn buffer_size(&self) -> usize {
        self.sequence
            .get(flow_tags::BUFFERSIZE)
            .and_then(Value::as_u64)
            .map(|v| v.max(1) as usize)
            .unwrap_or(64)
    }

    pub fn timeout(&self) -> Option<u64> {
        self.sequence.get(flow_tags::TIMEOUT).and_then(Value::as_u64)
    }

    /// Template for outgoing documents; JSON when none is configured.
    pub fn template(&self) -> Arc<dyn DocumentTemplate> {
        self.template
            .clone()
            .unwrap_or_else(|| Arc::new(crate::template::JsonTemplate))
    }
}

/// One backend session.
///
/// The module driver calls `connect` first and `close` last; between the two
/// it runs exactly one action, then `commit` on success or `rollback` on
/// failure. `rollback` resets the sent count and undoes partial output where
/// the backend permits.
#[async_trait]
pub trait Connector: Send {
    async fn connect(&mut self, ctx: &ModuleContext) -> Result<()>;

    /// Existence probe of the target.
    async fn check(&mut self, ctx: &ModuleContext) -> Result<bool>;

    /// Record count of the target.
    async fn count(&mut self, ctx: &ModuleContext) -> Result<u64>;

    async fn before_read(&mut self, ctx: &ModuleContext, rule: &MappingRule) -> Result<()>;

    /// Read everything that remains.
    async fn read(&mut self, ctx: &ModuleContext, rule: &MappingRule) -> Result<Vec<Record>>;

    /// Read up to `limit` records; an empty result means exhaustion.
    async fn read_partially(
        &mut self,
        ctx: &ModuleContext,
        rule: &MappingRule,
        limit: usize,
    ) -> Result<Vec<Record>>;

    async fn after_read(&mut self, ctx: &ModuleContext) -> Result<()>;

    async fn before_create(&mut self, ctx: &ModuleContext, rule: &MappingRule) -> Result<()>;

    /// Push one batch of records. On a mid-batch failure the error carries
    /// the position of the first failing record relative to the whole push.
    async fn create(
        &mut self,
        ctx: &ModuleContext,
        rule: &MappingRule,
        items: &[Record],
    ) -> Result<u64>;

    async fn after_create(&mut self, ctx: &ModuleContext, rule: &MappingRule) -> Result<()>;

    async fn delete(&mut self, ctx: &ModuleContext) -> Result<u64>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self, ctx: &ModuleContext) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Records pushed and committed so far.
    fn sent(&self) -> u64;

    /// Backend-specific evaluation of `>FUNC` rule items.
    fn function_processor(&self) -> Option<&dyn FunctionProcessor> {
        None
    }
}

type ConnectorBuilder = Box<dyn Fn() -> Box<dyn Connector> + Send + Sync>;

/// Registry of connector builders keyed by the CONNECTOR tag.
pub struct ConnectorFactory {
    builders: DashMap<String, ConnectorBuilder>,
}

impl ConnectorFactory {
    /// Factory with the built-in backends registered.
    pub fn with_builtins(pools: Arc<DbPools>) -> Self {
        let factory = Self {
            builders: DashMap::new(),
        };
        factory.register("FILE", || Box::new(FileConnector::new()));
        factory.register("FTP", || Box::new(FtpConnector::new()));
        factory.register("DB", move || Box::new(DbConnector::new(pools.clone())));
        factory
    }

    pub fn empty() -> Self {
        Self {
            builders: DashMap::new(),
        }
    }

    /// Register a builder; an existing name is replaced.
    pub fn register<F>(&self, name: &str, builder: F)
    where
        F: Fn() -> Box<dyn Connector> + Send + Sync + 'static,
    {
        self.builders
            .insert(name.to_uppercase(), Box::new(builder));
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Connector>> {
        let builder = self
            .builders
            .get(&name.to_uppercase())
            .ok_or_else(|| SluiceError::Config(format!("unknown connector {name}")))?;
        Ok(builder())
    }
}
