//! Flow: the module sequencer.
//!
//! A flow is one configured pipeline. `prepare` parses the definition into a
//! [`FlowContext`]; `process` resolves the entry module (a request parameter
//! override wins over the definition) and walks the call chain: advance the
//! cursor, run the module's three phases, repeat while a module names a
//! successor. The loop ends when no next module is set; whatever stream is
//! attached at that point is the flow's output.
//!
//! There is no cycle detection. A misconfigured call chain loops until its
//! data runs out, or until the optional `max_steps` cap aborts it.

mod context;
mod module;

pub use context::FlowContext;
pub use module::{Action, ConnectRef, Module, ModuleConfig};

use std::sync::Arc;

use serde_json::Value;

use crate::constants::{context_keys, flow_tags};
use crate::context::Context;
use crate::core::EngineServices;
use crate::error::{Result, SluiceError};
use crate::handler::LifecycleStep;
use crate::rule::MappingRule;
use crate::stream::InputStream;

pub struct Flow {
    pub id: String,
    pub target_id: String,
    ctx: FlowContext,
    pub result: Option<String>,
    pub message: String,
}

impl Flow {
    /// Build a runnable flow from its definition document.
    ///
    /// `channel` is the request context this flow runs under; `input` is the
    /// inbound stream, usually the request payload.
    pub fn prepare(
        target_id: impl Into<String>,
        definition: &Value,
        channel: &Context,
        input: Option<Arc<InputStream>>,
    ) -> Result<Self> {
        let target_id = target_id.into();
        let id = uuid::Uuid::new_v4().to_string();
        let mut ctx = FlowContext::new(id.clone(), target_id.clone(), channel.clone());
        ctx.set_stream(input);

        // the entry is a module name, or a method -> module name map
        let entry = match definition.get(flow_tags::ENTRY) {
            Some(Value::String(name)) => Some(name.clone()),
            Some(Value::Object(map)) => {
                let method = channel
                    .get_string(context_keys::REQUEST_METHOD)
                    .unwrap_or_default();
                map.get(&method)
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }
            _ => None,
        };
        ctx.set_entry(entry);
        ctx.debug = definition
            .get(flow_tags::DEBUG)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if let Some(Value::Object(modules)) = definition.get(flow_tags::MODULE) {
            for (name, def) in modules {
                ctx.add_module(Module::new(name.clone(), def.clone())?);
            }
        }

        if let Some(Value::Object(rules)) = definition.get(flow_tags::RULE) {
            for (name, items) in rules {
                let obj = items.as_object().ok_or_else(|| {
                    SluiceError::Config(format!("rule {name} is not an object"))
                })?;
                let pairs = obj
                    .iter()
                    .map(|(target, source)| (target.as_str(), source.as_str().unwrap_or_default()));
                ctx.add_rule(name.clone(), MappingRule::from_pairs(pairs));
            }
        }

        Ok(Self {
            id,
            target_id,
            ctx,
            result: None,
            message: String::new(),
        })
    }

    pub fn context(&self) -> &FlowContext {
        &self.ctx
    }

    /// Run the module chain to completion and return the remaining stream.
    pub async fn process(
        &mut self,
        services: &EngineServices,
    ) -> Result<Option<Arc<InputStream>>> {
        services
            .handlers
            .handle(LifecycleStep::FlowIn, &self.ctx.subject());

        let entry = self
            .ctx
            .get_string("CHANNEL.REQUEST_PARAMS.entry")
            .filter(|s| !s.is_empty())
            .or_else(|| self.ctx.entry().map(str::to_string));
        self.ctx.set_next(entry);

        let mut steps = 0usize;
        let mut failure: Option<SluiceError> = None;

        while let Some(name) = self.ctx.advance() {
            steps += 1;
            if let Some(max) = services.config.max_steps {
                if steps > max {
                    failure = Some(SluiceError::Logic(format!(
                        "flow {} exceeded {max} module activations",
                        self.target_id
                    )));
                    break;
                }
            }

            let Some(mut module) = self.ctx.take_module(&name) else {
                failure = Some(SluiceError::Config(format!("unknown module {name}")));
                break;
            };

            services
                .handlers
                .handle(LifecycleStep::ModuleIn, &module.subject(&self.id));

            let outcome = match module.config.pipe.clone() {
                Some(pipe_name) => self.run_pipe(services, &mut module, &pipe_name).await,
                None => self.run_single(services, &mut module).await,
            };
            if let Err(e) = &outcome {
                module.message = e.to_string();
            }

            services
                .handlers
                .handle(LifecycleStep::ModuleOut, &module.subject(&self.id));
            self.ctx.put_module(module);

            if let Err(e) = outcome {
                failure = Some(e);
                break;
            }
        }

        services
            .handlers
            .handle(LifecycleStep::FlowOut, &self.ctx.subject());

        match failure {
            Some(e) => {
                self.result = Some("fail".to_string());
                self.message = e.to_string();
                Err(e)
            }
            None => {
                self.result = Some("success".to_string());
                Ok(self.ctx.take_stream())
            }
        }
    }

    /// Run one module's three phases; the after phase always executes.
    async fn run_single(
        &mut self,
        services: &EngineServices,
        module: &mut Module,
    ) -> Result<()> {
        let phase = match module.process_before(services, &mut self.ctx).await {
            Ok(()) => with_timeout(module.timeout(), module.process(&mut self.ctx)).await,
            Err(e) => Err(e),
        };
        let success = phase.is_ok();
        let after = module.process_after(success).await;

        phase?;
        after?;
        self.ctx.set_next(module.config.call.clone());
        Ok(())
    }

    /// Streaming handoff between a READ module and the CREATE module its
    /// PIPE tag names. Batches move in production order; an empty batch from
    /// the source ends the loop. Both modules' before/after phases bracket
    /// the loop.
    async fn run_pipe(
        &mut self,
        services: &EngineServices,
        source: &mut Module,
        pipe_name: &str,
    ) -> Result<()> {
        if pipe_name == source.name {
            return Err(SluiceError::Logic(format!(
                "module {} pipes into itself",
                source.name
            )));
        }
        let Some(mut sink) = self.ctx.take_module(pipe_name) else {
            return Err(SluiceError::Logic(format!(
                "pipe target {pipe_name} not found"
            )));
        };
        if source.config.action != Action::Read || sink.config.action != Action::Create {
            self.ctx.put_module(sink);
            return Err(SluiceError::Logic(format!(
                "pipe {} -> {} must join READ to CREATE",
                source.name, pipe_name
            )));
        }

        services
            .handlers
            .handle(LifecycleStep::ModuleIn, &sink.subject(&self.id));

        let timeout = source.timeout();
        let phase = with_timeout(timeout, self.pipe_phase(services, source, &mut sink)).await;
        let success = phase.is_ok();
        let after_source = source.process_after(success).await;
        let after_sink = sink.process_after(success).await;

        if let Err(e) = &phase {
            sink.message = e.to_string();
        }
        services
            .handlers
            .handle(LifecycleStep::ModuleOut, &sink.subject(&self.id));

        // the source CALL drives the cursor; when it names the sink, which
        // already ran inside the pipe, the sink's own CALL takes over
        let next = match source.config.call.clone() {
            Some(call) if call == sink.name => sink.config.call.clone(),
            other => other,
        };
        self.ctx.put_module(sink);

        phase?;
        after_source?;
        after_sink?;
        self.ctx.set_next(next);
        Ok(())
    }

    async fn pipe_phase(
        &mut self,
        services: &EngineServices,
        source: &mut Module,
        sink: &mut Module,
    ) -> Result<()> {
        source.process_before(services, &mut self.ctx).await?;
        sink.process_before(services, &mut self.ctx).await?;

        loop {
            let batch = source.produce_partially().await?;
            if batch.is_empty() {
                break;
            }
            sink.consume_partially(&batch).await?;
        }

        source.finish_produce().await?;
        sink.finish_consume().await?;
        Ok(())
    }
}

/// Bound one data-movement phase by the module's TIMEOUT tag.
async fn with_timeout<T>(
    seconds: Option<u64>,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match seconds {
        Some(secs) => tokio::time::timeout(std::time::Duration::from_secs(secs), fut)
            .await
            .map_err(|_| SluiceError::Connect(format!("operation timed out after {secs}s")))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prepare_parses_entry_modules_and_rules() {
        let definition = json!({
            "ENTRY": "M1",
            "MODULE": {
                "M1": { "ACTION": "READ", "CONNECT": "DS_IN", "CALL": "M2" },
                "M2": { "ACTION": "CREATE", "CONNECT": "DS_OUT", "RULE": "R1" },
            },
            "RULE": {
                "R1": { "ID": "CODE", "SEQ": "#n" },
            },
        });
        let flow = Flow::prepare("IF_A", &definition, &Context::new(), None).unwrap();
        assert_eq!(flow.context().entry(), Some("M1"));
        assert_eq!(flow.context().rule("R1").unwrap().items().len(), 2);
    }

    #[test]
    fn entry_map_selects_by_request_method() {
        let definition = json!({
            "ENTRY": { "POST": "M_IN", "GET": "M_OUT" },
        });
        let mut channel = Context::new();
        channel.add(context_keys::REQUEST_METHOD, json!("GET"));
        let flow = Flow::prepare("IF_A", &definition, &channel, None).unwrap();
        assert_eq!(flow.context().entry(), Some("M_OUT"));
    }

    #[test]
    fn processing_future_moves_across_tasks() {
        fn require_send<T: Send>(_: &T) {}

        let services = EngineServices::for_tests();
        let definition = json!({
            "ENTRY": "M1",
            "MODULE": {
                "M1": { "ACTION": "CHECK", "CONNECT": "DS", "TARGET": "X" },
            },
        });
        let mut flow = Flow::prepare("IF_SPAWN", &definition, &Context::new(), None).unwrap();
        let fut = flow.process(&services);
        // channel fan-out and the spool lanes hand this future to tokio::spawn
        require_send(&fut);
    }

    #[test]
    fn bad_rule_shape_is_rejected() {
        let definition = json!({ "RULE": { "R1": [1, 2] } });
        assert!(Flow::prepare("IF_A", &definition, &Context::new(), None).is_err());
    }
}
