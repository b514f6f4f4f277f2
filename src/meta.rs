//! Metadata store: flow, API, datasource and template definitions.
//!
//! A record is a JSON object whose `DATA` field holds the actual definition.
//! Two implementations ship: an in-memory store for tests and embedders, and
//! a directory-backed store with one JSON file per table, each file being an
//! object of key -> record.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Result, SluiceError};

/// Field of a metadata record holding the definition body.
pub const DATA_FIELD: &str = "DATA";

/// Read access to definition tables.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Fetch one record by key, `None` when absent.
    async fn read(&self, table: &str, key: &str) -> Result<Option<Value>>;

    /// Fetch a whole table as key -> record.
    async fn load(&self, table: &str) -> Result<HashMap<String, Value>>;
}

/// Convenience: unwrap the `DATA` field of a record.
pub fn record_data(record: &Value) -> Option<&Value> {
    record.get(DATA_FIELD)
}

/// In-memory metadata store.
#[derive(Debug, Default)]
pub struct InMemoryMetaStore {
    tables: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a raw record (already shaped as `{ "DATA": ... }`).
    pub fn insert(&self, table: &str, key: &str, record: Value) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), record);
    }

    /// Insert a definition, wrapping it into the record shape.
    pub fn insert_data(&self, table: &str, key: &str, data: Value) {
        self.insert(table, key, serde_json::json!({ DATA_FIELD: data }));
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn read(&self, table: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }

    async fn load(&self, table: &str) -> Result<HashMap<String, Value>> {
        Ok(self.tables.read().get(table).cloned().unwrap_or_default())
    }
}

/// Directory-backed metadata store, one `<table>.json` file per table.
#[derive(Debug)]
pub struct FileMetaStore {
    folder: PathBuf,
}

impl FileMetaStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self { folder: folder.into() }
    }

    async fn read_table(&self, table: &str) -> Result<HashMap<String, Value>> {
        let path = self.folder.join(format!("{table}.json"));
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let raw = tokio::fs::read(&path).await?;
        let parsed: Value = serde_json::from_slice(&raw)?;
        let obj = parsed.as_object().ok_or_else(|| {
            SluiceError::Protocol(format!("metadata table {table} is not a JSON object"))
        })?;
        Ok(obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

#[async_trait]
impl MetaStore for FileMetaStore {
    async fn read(&self, table: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.read_table(table).await?.remove(key))
    }

    async fn load(&self, table: &str) -> Result<HashMap<String, Value>> {
        self.read_table(table).await
    }
}
