//! Database backend over PostgreSQL.
//!
//! Connections come from a shared pool cache keyed by URL and user. Every
//! module activation runs inside one explicit transaction: records are
//! inserted row by row through a prepared statement rendered from the
//! mapping rule, and `commit`/`rollback` close the transaction out. READ
//! materializes the result set up front and serves it through the partial
//! read calls.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Postgres, Row, Transaction, TypeInfo};

use crate::error::{Result, SluiceError};
use crate::rule::{FunctionProcessor, MappingRule, MappingRuleItem, ParamSource, RuleAction};
use crate::stream::Record;
use crate::template::{DocumentTemplate, SqlTemplate};

use super::{ConnectInfo, Connector, ModuleContext};

/// Pool cache shared by every DB connector of one engine.
#[derive(Default)]
pub struct DbPools {
    pools: DashMap<String, PgPool>,
}

impl DbPools {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, info: &ConnectInfo) -> Result<PgPool> {
        let key = format!("{}@{}", info.user, info.url);
        if let Some(pool) = self.pools.get(&key) {
            return Ok(pool.clone());
        }
        let mut options = PgConnectOptions::from_str(&info.url)
            .map_err(|e| SluiceError::Connect(format!("bad database url: {e}")))?;
        if !info.user.is_empty() {
            options = options.username(&info.user);
        }
        if !info.password.is_empty() {
            options = options.password(&info.password);
        }
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        self.pools.insert(key, pool.clone());
        Ok(pool)
    }
}

struct DbFunctions {
    seq: AtomicU64,
}

impl DbFunctions {
    fn evaluate(&self, name: &str) -> Option<Value> {
        match name {
            "DATE" | "TARGET_DATE" => Some(Value::String(
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            )),
            "SEQ" => Some(Value::from(self.seq.fetch_add(1, Ordering::Relaxed) + 1)),
            _ => None,
        }
    }
}

impl FunctionProcessor for DbFunctions {
    fn process(&self, item: &MappingRuleItem) -> Option<Value> {
        self.evaluate(&item.source_name)
    }
}

pub struct DbConnector {
    pools: Arc<DbPools>,
    tx: Option<Transaction<'static, Postgres>>,
    insert_sql: Option<String>,
    params: Vec<ParamSource>,
    buffered: Vec<Record>,
    retrieved: u64,
    sent: u64,
    functions: DbFunctions,
}

impl DbConnector {
    pub fn new(pools: Arc<DbPools>) -> Self {
        Self {
            pools,
            tx: None,
            insert_sql: None,
            params: Vec::new(),
            buffered: Vec::new(),
            retrieved: 0,
            sent: 0,
            functions: DbFunctions {
                seq: AtomicU64::new(0),
            },
        }
    }

    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| SluiceError::Connect("db connector is not connected".into()))
    }

    /// SELECT statement for a read: an explicit SQL override wins, otherwise
    /// the column list is collected from the mapping rule.
    fn build_select(ctx: &ModuleContext, rule: &MappingRule) -> Result<String> {
        if let Some(sql) = ctx.sql() {
            return Ok(sql);
        }
        let target = ctx.target()?;

        let mut columns: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !columns.iter().any(|c| c == name) {
                columns.push(name.to_string());
            }
        };
        for item in rule.items() {
            match item.action {
                RuleAction::Reference => push(&item.source_name),
                // literal items pull the columns they substitute
                RuleAction::Literal => {
                    let mut rest = item.source_name.as_str();
                    while let Some(open) = rest.find('$') {
                        let after = &rest[open + 1..];
                        match after.find('$') {
                            Some(close) if close > 0 => {
                                push(&after[..close]);
                                rest = &after[close + 1..];
                            }
                            _ => break,
                        }
                    }
                }
                RuleAction::System | RuleAction::Function | RuleAction::Order => {}
            }
        }

        let column_list = if columns.is_empty() {
            "*".to_string()
        } else {
            columns.join(", ")
        };
        let mut query = format!("SELECT {column_list} FROM {target}");
        if let Some(condition) = ctx.condition() {
            if !condition.is_empty() {
                query.push_str(" WHERE ");
                query.push_str(&condition);
            }
        }
        Ok(query)
    }

    fn row_to_record(row: &PgRow) -> Record {
        let mut record = Record::new();
        for (i, column) in row.columns().iter().enumerate() {
            let name = column.name().to_string();
            let value = match column.type_info().name() {
                "INT2" => row.try_get::<Option<i16>, _>(i).ok().flatten().map(Value::from),
                "INT4" => row.try_get::<Option<i32>, _>(i).ok().flatten().map(Value::from),
                "INT8" => row.try_get::<Option<i64>, _>(i).ok().flatten().map(Value::from),
                "FLOAT4" => row.try_get::<Option<f32>, _>(i).ok().flatten().map(Value::from),
                "FLOAT8" => row.try_get::<Option<f64>, _>(i).ok().flatten().map(Value::from),
                "BOOL" => row.try_get::<Option<bool>, _>(i).ok().flatten().map(Value::from),
                "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(i).ok().flatten(),
                "TIMESTAMP" => row
                    .try_get::<Option<chrono::NaiveDateTime>, _>(i)
                    .ok()
                    .flatten()
                    .map(|t| Value::String(t.format("%Y-%m-%d %H:%M:%S").to_string())),
                "TIMESTAMPTZ" => row
                    .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
                    .ok()
                    .flatten()
                    .map(|t| Value::String(t.to_rfc3339())),
                "DATE" => row
                    .try_get::<Option<chrono::NaiveDate>, _>(i)
                    .ok()
                    .flatten()
                    .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
                "UUID" => row
                    .try_get::<Option<uuid::Uuid>, _>(i)
                    .ok()
                    .flatten()
                    .map(|u| Value::String(u.to_string())),
                _ => row
                    .try_get::<Option<String>, _>(i)
                    .ok()
                    .flatten()
                    .map(Value::String),
            };
            record.insert(name, value.unwrap_or(Value::Null));
        }
        record
    }

    fn param_value(&self, ctx: &ModuleContext, row: &Record, seq: u64, param: &ParamSource) -> Value {
        match param {
            ParamSource::Column(name) => row.get(name).cloned().unwrap_or(Value::Null),
            ParamSource::Context(path) => ctx
                .context
                .get(path)
                .and_then(|v| v.as_json().cloned())
                .unwrap_or(Value::Null),
            ParamSource::Function(name) => {
                self.functions.evaluate(name).unwrap_or(Value::Null)
            }
            ParamSource::Order => Value::from(seq),
        }
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    value: Value,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => query.bind(s),
        other => query.bind(other),
    }
}

#[async_trait]
impl Connector for DbConnector {
    async fn connect(&mut self, ctx: &ModuleContext) -> Result<()> {
        let pool = self.pools.get(&ctx.connect_info).await?;
        self.tx = Some(pool.begin().await?);
        Ok(())
    }

    async fn check(&mut self, ctx: &ModuleContext) -> Result<bool> {
        let target = ctx.target()?;
        let tx = self.tx()?;
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(&target)
            .fetch_one(&mut **tx)
            .await?;
        Ok(exists)
    }

    async fn count(&mut self, ctx: &ModuleContext) -> Result<u64> {
        let target = ctx.target()?;
        let mut query = format!("SELECT COUNT(*) FROM {target}");
        if let Some(condition) = ctx.condition() {
            if !condition.is_empty() {
                query.push_str(" WHERE ");
                query.push_str(&condition);
            }
        }
        let tx = self.tx()?;
        let count: i64 = sqlx::query_scalar(&query).fetch_one(&mut **tx).await?;
        Ok(count.max(0) as u64)
    }

    async fn before_read(&mut self, ctx: &ModuleContext, rule: &MappingRule) -> Result<()> {
        let query = Self::build_select(ctx, rule)?;
        tracing::debug!(query, "db read");
        let tx = self.tx()?;
        let rows = sqlx::query(&query).fetch_all(&mut **tx).await?;
        self.buffered = rows.iter().map(Self::row_to_record).collect();
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
        let sql = SqlTemplate::new(ctx.target()?).make_header(&ctx.context, rule)?;
        tracing::debug!(sql, "db create");
        self.insert_sql = Some(sql);
        self.params = rule.params();
        Ok(())
    }

    async fn create(
        &mut self,
        ctx: &ModuleContext,
        _rule: &MappingRule,
        items: &[Record],
    ) -> Result<u64> {
        let sql = self
            .insert_sql
            .clone()
            .ok_or_else(|| SluiceError::Logic("create before before_create".into()))?;
        let params = self.params.clone();

        for (i, row) in items.iter().enumerate() {
            let seq = self.sent + i as u64;
            let mut query = sqlx::query(&sql);
            for param in &params {
                query = bind_value(query, self.param_value(ctx, row, seq, param));
            }
            let tx = self.tx()?;
            query.execute(&mut **tx).await.map_err(|e| SluiceError::Data {
                position: (self.sent + i as u64) as usize,
                reason: e.to_string(),
            })?;
        }

        self.sent += items.len() as u64;
        ctx.progress.report(self.sent);
        Ok(self.sent)
    }

    async fn after_create(&mut self, _ctx: &ModuleContext, _rule: &MappingRule) -> Result<()> {
        Ok(())
    }

    async fn delete(&mut self, ctx: &ModuleContext) -> Result<u64> {
        let target = ctx.target()?;
        let mut query = format!("DELETE FROM {target}");
        if let Some(condition) = ctx.condition() {
            if !condition.is_empty() {
                query.push_str(" WHERE ");
                query.push_str(&condition);
            }
        }
        let tx = self.tx()?;
        let done = sqlx::query(&query).execute(&mut **tx).await?;
        Ok(done.rows_affected())
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self, ctx: &ModuleContext) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        self.sent = 0;
        ctx.progress.report(0);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // an open transaction rolls back on drop
        self.tx = None;
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
