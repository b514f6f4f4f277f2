//! Per-invocation flow state.
//!
//! A [`FlowContext`] lives exactly as long as one [`super::Flow`] run. It
//! holds the module and rule registries parsed from the flow definition, the
//! module cursor the sequencer walks, the in-flight stream, and an embedded
//! [`Context`] tree whose `CHANNEL` child is the request context the flow
//! was invoked under.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::constants::context_keys;
use crate::context::Context;
use crate::rule::MappingRule;
use crate::stream::InputStream;

use super::module::Module;

pub struct FlowContext {
    /// Unique id of this flow invocation.
    pub id: String,
    /// The flow (interface) this invocation runs.
    pub target_id: String,
    pub debug: bool,

    entry: Option<String>,
    modules: HashMap<String, Module>,
    rules: HashMap<String, MappingRule>,

    previous: Option<String>,
    current: Option<String>,
    next: Option<String>,

    stream: Option<Arc<InputStream>>,

    /// Value tree visible to modules; `CHANNEL` holds the request context.
    pub context: Context,
}

impl FlowContext {
    pub fn new(id: String, target_id: String, channel: Context) -> Self {
        let mut context = Context::new();
        context.add_context(context_keys::CHANNEL, channel);
        Self {
            id,
            target_id,
            debug: false,
            entry: None,
            modules: HashMap::new(),
            rules: HashMap::new(),
            previous: None,
            current: None,
            next: None,
            stream: None,
            context,
        }
    }

    pub fn set_entry(&mut self, entry: Option<String>) {
        self.entry = entry;
    }

    pub fn entry(&self) -> Option<&str> {
        self.entry.as_deref()
    }

    pub fn add_module(&mut self, module: Module) {
        self.modules.insert(module.name.clone(), module);
    }

    /// Detach a module so it can run with a mutable borrow of this context;
    /// the sequencer puts it back via [`FlowContext::put_module`].
    pub fn take_module(&mut self, name: &str) -> Option<Module> {
        self.modules.remove(name)
    }

    pub fn put_module(&mut self, module: Module) {
        self.modules.insert(module.name.clone(), module);
    }

    pub fn add_rule(&mut self, name: impl Into<String>, rule: MappingRule) {
        self.rules.insert(name.into(), rule);
    }

    pub fn rule(&self, name: &str) -> Option<&MappingRule> {
        self.rules.get(name)
    }

    /// Queue the module to run next. `None` ends the sequencing loop.
    pub fn set_next(&mut self, next: Option<String>) {
        self.next = next;
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    /// Move the cursor forward and return the new current module name.
    pub fn advance(&mut self) -> Option<String> {
        let next = self.next.take()?;
        self.previous = self.current.take();
        self.current = Some(next.clone());
        Some(next)
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn set_stream(&mut self, stream: Option<Arc<InputStream>>) {
        self.stream = stream;
    }

    pub fn stream(&self) -> Option<Arc<InputStream>> {
        self.stream.clone()
    }

    pub fn take_stream(&mut self) -> Option<Arc<InputStream>> {
        self.stream.take()
    }

    /// Snapshot of the embedded value tree handed to connectors.
    pub fn context_snapshot(&self) -> Context {
        self.context.clone()
    }

    /// Resolve a string against the embedded tree, dotted paths included.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.context.get_string(key)
    }

    /// Subject document for lifecycle events about this flow.
    pub fn subject(&self) -> Value {
        serde_json::json!({
            "FLOW_ID": self.id,
            "TARGET": self.target_id,
            "CURRENT": self.current,
        })
    }
}
