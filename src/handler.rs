//! Lifecycle hooks.
//!
//! An ordered list of handlers observes the engine at fixed points: channel
//! in/out, flow in/out, module in/out and module progress. Handlers receive
//! the current step and a JSON payload describing the subject. They are used
//! for logging, history persistence and progress reporting; a failing handler
//! is logged and skipped, it never fails the flow.

use serde_json::Value;

/// Fixed lifecycle points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleStep {
    ChannelIn,
    ChannelOut,
    FlowIn,
    FlowOut,
    ModuleIn,
    ModuleOut,
    ModuleProgress,
}

impl LifecycleStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStep::ChannelIn => "CHANNEL_IN",
            LifecycleStep::ChannelOut => "CHANNEL_OUT",
            LifecycleStep::FlowIn => "FLOW_IN",
            LifecycleStep::FlowOut => "FLOW_OUT",
            LifecycleStep::ModuleIn => "MODULE_IN",
            LifecycleStep::ModuleOut => "MODULE_OUT",
            LifecycleStep::ModuleProgress => "MODULE_PROGRESS",
        }
    }
}

/// One lifecycle observer.
pub trait LifecycleHandler: Send + Sync {
    fn handle(&self, step: LifecycleStep, subject: &Value) -> anyhow::Result<()>;
}

/// Ordered, named handler list.
#[derive(Default)]
pub struct HandlerSet {
    handlers: Vec<(String, Box<dyn LifecycleHandler>)>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a name already present is left untouched.
    pub fn add(&mut self, name: impl Into<String>, handler: Box<dyn LifecycleHandler>) {
        let name = name.into();
        if self.handlers.iter().any(|(n, _)| *n == name) {
            return;
        }
        self.handlers.push((name, handler));
    }

    pub fn remove(&mut self, name: &str) {
        self.handlers.retain(|(n, _)| n != name);
    }

    /// Invoke every handler in registration order.
    pub fn handle(&self, step: LifecycleStep, subject: &Value) {
        for (name, handler) in &self.handlers {
            if let Err(e) = handler.handle(step, subject) {
                tracing::warn!(handler = %name, step = step.as_str(), error = %e,
                    "lifecycle handler failed, skipping");
            }
        }
    }
}

/// Default handler: structured log line per lifecycle event.
pub struct LogHandler;

impl LifecycleHandler for LogHandler {
    fn handle(&self, step: LifecycleStep, subject: &Value) -> anyhow::Result<()> {
        tracing::info!(step = step.as_str(), subject = %subject, "lifecycle");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Recording(Arc<Mutex<Vec<&'static str>>>);

    impl LifecycleHandler for Recording {
        fn handle(&self, step: LifecycleStep, _subject: &Value) -> anyhow::Result<()> {
            self.0.lock().push(step.as_str());
            Ok(())
        }
    }

    struct Failing;

    impl LifecycleHandler for Failing {
        fn handle(&self, _step: LifecycleStep, _subject: &Value) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[test]
    fn handlers_run_in_order_and_failures_are_skipped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut set = HandlerSet::new();
        set.add("fail", Box::new(Failing));
        set.add("rec", Box::new(Recording(seen.clone())));
        // duplicate name is ignored
        set.add("rec", Box::new(Failing));

        set.handle(LifecycleStep::FlowIn, &serde_json::json!({}));
        set.handle(LifecycleStep::FlowOut, &serde_json::json!({}));

        assert_eq!(*seen.lock(), vec!["FLOW_IN", "FLOW_OUT"]);
    }
}
