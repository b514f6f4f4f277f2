//! Channel dispatch: one request fanning out to target flows.
//!
//! A [`ChannelAgent`] owns the request context. `process` resolves the API
//! definition, expands the target list, optionally backs the inbound payload
//! up to disk, then runs one [`ChannelJob`] per target, sequentially or on
//! concurrent tasks. Per-target failures never abort sibling targets; the
//! aggregate result is "fail" when any target failed.
//!
//! A job either runs its flow to completion, or, when the flow is marked
//! SPOOLING, persists a descriptor and hands the id to the spooler,
//! answering `{result: "spooled", ID}` immediately.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::constants::{api_tags, context_keys, flow_tags, spool_tags};
use crate::context::Context;
use crate::core::EngineServices;
use crate::error::{Result, SluiceError};
use crate::flow::Flow;
use crate::handler::LifecycleStep;
use crate::meta::record_data;
use crate::spool::SpoolingManager;
use crate::stream::InputStream;

/// Resolve the flow definition for a target: an inline `FLOW` entry in the
/// request context wins over the metadata store.
pub(crate) async fn resolve_flow_definition(
    services: &EngineServices,
    context: &Context,
    target: &str,
) -> Result<Value> {
    if let Some(inline) = context
        .get(context_keys::FLOW)
        .and_then(|v| v.as_json().cloned())
    {
        return Ok(inline);
    }
    let record = services
        .meta
        .read(&services.config.flow_table, target)
        .await?
        .ok_or_else(|| SluiceError::Config(format!("flow {target} not found")))?;
    record_data(&record)
        .cloned()
        .ok_or_else(|| SluiceError::Config(format!("flow {target} has no DATA")))
}

pub struct ChannelAgent {
    services: Arc<EngineServices>,
    spooler: Arc<SpoolingManager>,
    context: Context,
}

impl ChannelAgent {
    pub fn new(services: Arc<EngineServices>, spooler: Arc<SpoolingManager>) -> Self {
        Self {
            services,
            spooler,
            context: Context::new(),
        }
    }

    /// Attach request data (params, path variables, body, method) before
    /// processing.
    pub fn add_context(&mut self, key: impl Into<String>, value: Value) {
        self.context.add(key, value);
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Run one request against the named API and return the per-target
    /// result map.
    pub async fn process(
        &mut self,
        stream: Option<Arc<InputStream>>,
        api: &str,
    ) -> Result<Value> {
        let channel_id = match self.context.get_string(context_keys::CHANNEL_ID) {
            Some(id) if !id.is_empty() => id,
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                self.context.add(context_keys::CHANNEL_ID, json!(id));
                id
            }
        };
        self.context.add(context_keys::API, json!(api));

        let api_info = self.resolve_api_info(api).await?;
        if let Some(false) = api_info.get(api_tags::ENABLE).and_then(Value::as_bool) {
            return Err(SluiceError::Config(format!("api {api} is disabled")));
        }

        self.services.handlers.handle(
            LifecycleStep::ChannelIn,
            &json!({ "CHANNEL_ID": channel_id, "API": api }),
        );

        let targets = self.resolve_targets(&api_info);
        tracing::debug!(channel = %channel_id, ?targets, "channel dispatch");

        // with no explicit stream, a JSON request body becomes one; single
        // mode, so every fanned-out target reads the whole document
        let stream = stream.or_else(|| {
            self.context
                .get(context_keys::REQUEST_BODY)
                .and_then(|v| v.as_json().cloned())
                .map(|body| Arc::new(InputStream::single(body)))
        });

        if api_info
            .get(api_tags::BACKUP_PAYLOAD)
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            if let Some(stream) = &stream {
                let path = self.services.config.payload_folder.join(&channel_id);
                if let Err(e) = stream.flush_to_file(&path) {
                    tracing::warn!(error = %e, "payload backup failed");
                }
            }
        }

        let concurrent = api_info
            .get(api_tags::CONCURRENCY)
            .and_then(|c| c.get(api_tags::ENABLE))
            .and_then(Value::as_bool)
            .unwrap_or(self.services.config.concurrent_channels);

        let mut result = serde_json::Map::new();
        if concurrent {
            let mut handles = Vec::with_capacity(targets.len());
            for target in &targets {
                // every job gets its own deep copy of the request context
                let job = ChannelJob::new(
                    target.clone(),
                    self.context.clone(),
                    stream.clone(),
                    self.services.clone(),
                    self.spooler.clone(),
                );
                handles.push(tokio::spawn(job.run()));
            }
            let outcomes = futures::future::join_all(handles).await;
            for (target, outcome) in targets.iter().zip(outcomes) {
                let value = match outcome {
                    Ok(v) => v,
                    Err(e) => json!({ "result": "fail", "reason": format!("job panicked: {e}") }),
                };
                result.insert(target.clone(), value);
            }
        } else {
            for target in &targets {
                let job = ChannelJob::new(
                    target.clone(),
                    self.context.clone(),
                    stream.clone(),
                    self.services.clone(),
                    self.spooler.clone(),
                );
                result.insert(target.clone(), job.run().await);
            }
        }

        let success = result
            .values()
            .all(|v| v.get("result").and_then(Value::as_str) != Some("fail"));
        let message = result
            .values()
            .filter(|v| v.get("result").and_then(Value::as_str) == Some("fail"))
            .filter_map(|v| v.get("reason").and_then(Value::as_str))
            .next()
            .unwrap_or_default()
            .to_string();
        self.context.add(
            context_keys::LATEST_RESULT,
            json!(if success { "success" } else { "fail" }),
        );
        self.context.add(context_keys::LATEST_MSG, json!(message));

        self.services.handlers.handle(
            LifecycleStep::ChannelOut,
            &json!({ "CHANNEL_ID": channel_id, "API": api, "RESULT": success }),
        );

        Ok(json!({ "result": Value::Object(result) }))
    }

    async fn resolve_api_info(&self, api: &str) -> Result<Value> {
        let record = self
            .services
            .meta
            .read(&self.services.config.api_table, api)
            .await?;
        if let Some(record) = record {
            return record_data(&record)
                .cloned()
                .ok_or_else(|| SluiceError::Config(format!("api {api} has no DATA")));
        }
        self.context
            .get(context_keys::API_META)
            .and_then(|v| v.as_json().cloned())
            .ok_or_else(|| SluiceError::Config(format!("cannot find resource {api}")))
    }

    /// Expand the target list: a TARGET group map filtered by the `targets`
    /// request parameter, or the single `target` path variable.
    fn resolve_targets(&self, api_info: &Value) -> Vec<String> {
        let mut targets = Vec::new();
        match api_info.get(api_tags::TARGET).and_then(Value::as_object) {
            Some(group_map) if !group_map.is_empty() => {
                let requested = self
                    .context
                    .get_string("REQUEST_PARAMS.targets")
                    .unwrap_or_default();
                if requested.is_empty() {
                    for group in group_map.values() {
                        push_group(&mut targets, group);
                    }
                } else {
                    for token in requested.split(',') {
                        match group_map.get(token) {
                            Some(group) => push_group(&mut targets, group),
                            None => targets.push(token.trim().to_uppercase()),
                        }
                    }
                }
            }
            _ => {
                if let Some(target) = self.context.get_string("REQUEST_PATH_VARIABLES.target") {
                    targets.push(target);
                }
            }
        }
        targets
    }
}

fn push_group(targets: &mut Vec<String>, group: &Value) {
    if let Some(items) = group.as_array() {
        targets.extend(items.iter().filter_map(Value::as_str).map(str::to_string));
    }
}

/// One target's unit of work within a channel.
pub struct ChannelJob {
    target: String,
    context: Context,
    stream: Option<Arc<InputStream>>,
    services: Arc<EngineServices>,
    spooler: Arc<SpoolingManager>,
}

impl ChannelJob {
    pub fn new(
        target: String,
        context: Context,
        stream: Option<Arc<InputStream>>,
        services: Arc<EngineServices>,
        spooler: Arc<SpoolingManager>,
    ) -> Self {
        Self {
            target,
            context,
            stream,
            services,
            spooler,
        }
    }

    /// Run the job; failures fold into the result document instead of
    /// propagating, so sibling targets keep running.
    pub async fn run(self) -> Value {
        match self.execute().await {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(target = %self.target, error = %e, "channel job failed");
                json!({ "result": "fail", "reason": e.to_string() })
            }
        }
    }

    async fn execute(&self) -> Result<Value> {
        let definition =
            resolve_flow_definition(&self.services, &self.context, &self.target).await?;

        if definition
            .get(flow_tags::SPOOLING)
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let flow_id = self.spool(&definition).await?;
            return Ok(json!({ "result": "spooled", "ID": flow_id }));
        }

        let mut flow = Flow::prepare(
            self.target.clone(),
            &definition,
            &self.context,
            self.stream.clone(),
        )?;
        let output = flow.process(&self.services).await?;

        match output.and_then(|stream| stream.snapshot()) {
            Some(snapshot) => Ok(snapshot),
            None => Ok(json!({ "result": "success", "reason": "" })),
        }
    }

    /// Persist the job descriptor and enqueue it; the raw request body stays
    /// out of the descriptor, the payload backup file carries it instead.
    async fn spool(&self, _definition: &Value) -> Result<String> {
        let flow_id = uuid::Uuid::new_v4().to_string();
        let descriptor = json!({
            spool_tags::TARGET: self.target,
            spool_tags::CONTEXT: self.context.to_json_without(&[context_keys::REQUEST_BODY]),
        });

        let folder = &self.services.config.spool_folder;
        tokio::fs::create_dir_all(folder).await?;
        tokio::fs::write(
            folder.join(&flow_id),
            serde_json::to_vec_pretty(&descriptor)?,
        )
        .await?;

        self.spooler.enqueue(flow_id.clone());
        Ok(flow_id)
    }
}
