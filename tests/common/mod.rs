//! Shared test fixtures: an engine wired to an in-memory metadata store and
//! a recording mock connector.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use sluice_core::config::EngineConfig;
use sluice_core::connector::{Connector, ConnectorFactory, ModuleContext};
use sluice_core::core::EngineServices;
use sluice_core::error::{Result, SluiceError};
use sluice_core::handler::HandlerSet;
use sluice_core::meta::InMemoryMetaStore;
use sluice_core::rule::MappingRule;
use sluice_core::security::PlainSecrets;
use sluice_core::stream::Record;

/// Observable state shared between a test and every mock connector instance
/// the factory builds for it.
#[derive(Default)]
pub struct MockState {
    /// Rows served by read operations.
    pub rows: Mutex<Vec<Record>>,
    /// Size of each batch handed to `create`, in call order.
    pub created_batches: Mutex<Vec<usize>>,
    /// Sent counter as left by the last commit or rollback.
    pub sent: AtomicU64,
    /// Global record position at which `create` fails, if any.
    pub fail_at: Mutex<Option<usize>>,
    /// Marker strings recorded by `check`, in call order.
    pub checks: Mutex<Vec<String>>,
    /// Artificial latency inside `check`, to surface ordering races.
    pub check_delay: Mutex<Duration>,
    /// Position of the last data error reported by `create`.
    pub last_error_position: Mutex<Option<usize>>,
}

impl MockState {
    pub fn with_rows(n: usize) -> Arc<Self> {
        let state = Arc::new(Self::default());
        *state.rows.lock() = make_rows(n);
        state
    }
}

pub fn make_rows(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            json!({ "ID": i, "NAME": format!("row-{i}") })
                .as_object()
                .cloned()
                .unwrap_or_default()
        })
        .collect()
}

/// Connector double: serves the shared row set and records every push.
pub struct MockConnector {
    state: Arc<MockState>,
    cursor: usize,
    sent: u64,
}

impl MockConnector {
    pub fn new(state: Arc<MockState>) -> Self {
        Self {
            state,
            cursor: 0,
            sent: 0,
        }
    }

    fn take(&mut self, limit: Option<usize>) -> Vec<Record> {
        let rows = self.state.rows.lock();
        let end = match limit {
            Some(limit) => (self.cursor + limit).min(rows.len()),
            None => rows.len(),
        };
        let batch = rows[self.cursor..end].to_vec();
        self.cursor = end;
        batch
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&mut self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }

    async fn check(&mut self, ctx: &ModuleContext) -> Result<bool> {
        let delay = *self.state.check_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let marker = ctx
            .context
            .get_string("CHANNEL.MARK")
            .unwrap_or_else(|| ctx.module_name.clone());
        self.state.checks.lock().push(marker);
        Ok(true)
    }

    async fn count(&mut self, _ctx: &ModuleContext) -> Result<u64> {
        Ok(self.state.rows.lock().len() as u64)
    }

    async fn before_read(&mut self, _ctx: &ModuleContext, _rule: &MappingRule) -> Result<()> {
        Ok(())
    }

    async fn read(&mut self, _ctx: &ModuleContext, _rule: &MappingRule) -> Result<Vec<Record>> {
        Ok(self.take(None))
    }

    async fn read_partially(
        &mut self,
        _ctx: &ModuleContext,
        _rule: &MappingRule,
        limit: usize,
    ) -> Result<Vec<Record>> {
        Ok(self.take(Some(limit)))
    }

    async fn after_read(&mut self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }

    async fn before_create(&mut self, _ctx: &ModuleContext, _rule: &MappingRule) -> Result<()> {
        Ok(())
    }

    async fn create(
        &mut self,
        _ctx: &ModuleContext,
        _rule: &MappingRule,
        items: &[Record],
    ) -> Result<u64> {
        let fail_at = *self.state.fail_at.lock();
        if let Some(position) = fail_at {
            let start = self.sent as usize;
            if (start..start + items.len()).contains(&position) {
                *self.state.last_error_position.lock() = Some(position);
                return Err(SluiceError::Data {
                    position,
                    reason: "injected failure".to_string(),
                });
            }
        }
        self.state.created_batches.lock().push(items.len());
        self.sent += items.len() as u64;
        self.state.sent.store(self.sent, Ordering::Relaxed);
        Ok(items.len() as u64)
    }

    async fn after_create(&mut self, _ctx: &ModuleContext, _rule: &MappingRule) -> Result<()> {
        Ok(())
    }

    async fn delete(&mut self, _ctx: &ModuleContext) -> Result<u64> {
        Ok(0)
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&mut self, _ctx: &ModuleContext) -> Result<()> {
        self.sent = 0;
        self.state.sent.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn sent(&self) -> u64 {
        self.sent
    }
}

/// Inline datasource definition routed to the mock connector.
pub fn mock_connect() -> serde_json::Value {
    json!({ "CONNECTOR": "MOCK", "URL": "mock://test" })
}

/// Service bundle backed by an in-memory store, no lifecycle handlers and a
/// factory that only knows the mock connector.
pub fn test_services(state: Arc<MockState>) -> (Arc<EngineServices>, Arc<InMemoryMetaStore>) {
    test_services_with_config(state, EngineConfig::default())
}

pub fn test_services_with_config(
    state: Arc<MockState>,
    config: EngineConfig,
) -> (Arc<EngineServices>, Arc<InMemoryMetaStore>) {
    let meta = Arc::new(InMemoryMetaStore::new());
    let connectors = ConnectorFactory::empty();
    connectors.register("MOCK", move || Box::new(MockConnector::new(state.clone())));

    let services = Arc::new(EngineServices {
        config,
        meta: meta.clone(),
        handlers: Arc::new(HandlerSet::new()),
        secrets: Arc::new(PlainSecrets),
        connectors: Arc::new(connectors),
    });
    (services, meta)
}
