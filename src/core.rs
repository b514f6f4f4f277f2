//! Engine assembly.
//!
//! [`EngineServices`] is the explicit dependency bundle every layer receives
//! instead of reaching for globals: configuration, the metadata store, the
//! lifecycle handler set, the secret decryptor and the connector factory.
//! [`EngineCore`] wires the bundle together, starts the spooler and hands out
//! channel agents.

use std::sync::Arc;

use crate::channel::ChannelAgent;
use crate::config::EngineConfig;
use crate::connector::{ConnectorFactory, DbPools};
use crate::handler::{HandlerSet, LogHandler};
use crate::meta::MetaStore;
use crate::security::{PlainSecrets, Secrets};
use crate::spool::SpoolingManager;

/// Everything the channel, flow and module layers depend on.
pub struct EngineServices {
    pub config: EngineConfig,
    pub meta: Arc<dyn MetaStore>,
    pub handlers: Arc<HandlerSet>,
    pub secrets: Arc<dyn Secrets>,
    pub connectors: Arc<ConnectorFactory>,
}

impl EngineServices {
    /// Bundle with the default handler set, plain secrets and the built-in
    /// connector backends.
    pub fn new(config: EngineConfig, meta: Arc<dyn MetaStore>) -> Self {
        let mut handlers = HandlerSet::new();
        handlers.add("log", Box::new(LogHandler));
        Self {
            config,
            meta,
            handlers: Arc::new(handlers),
            secrets: Arc::new(PlainSecrets),
            connectors: Arc::new(ConnectorFactory::with_builtins(Arc::new(DbPools::new()))),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let dir = std::env::temp_dir().join(format!("sluice-test-{}", uuid::Uuid::new_v4()));
        let mut config = EngineConfig::default();
        config.spool_folder = dir.join("spool");
        config.payload_folder = dir.join("payload");
        Self {
            config,
            meta: Arc::new(crate::meta::InMemoryMetaStore::new()),
            handlers: Arc::new(HandlerSet::new()),
            secrets: Arc::new(PlainSecrets),
            connectors: Arc::new(ConnectorFactory::empty()),
        }
    }
}

/// Running engine: the service bundle plus the background spooler.
pub struct EngineCore {
    services: Arc<EngineServices>,
    spooler: Arc<SpoolingManager>,
}

impl EngineCore {
    /// Assemble the engine and start its spool workers. Must run inside a
    /// tokio runtime.
    pub fn start(config: EngineConfig, meta: Arc<dyn MetaStore>) -> Self {
        Self::with_services(Arc::new(EngineServices::new(config, meta)))
    }

    /// Start from a caller-built service bundle, for custom handler sets,
    /// secret stores or connector registrations.
    pub fn with_services(services: Arc<EngineServices>) -> Self {
        let spooler = SpoolingManager::start(services.clone());
        Self { services, spooler }
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn spooler(&self) -> &Arc<SpoolingManager> {
        &self.spooler
    }

    /// A fresh agent for one inbound request.
    pub fn channel_agent(&self) -> ChannelAgent {
        ChannelAgent::new(self.services.clone(), self.spooler.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::InMemoryMetaStore;

    #[tokio::test]
    async fn core_hands_out_channel_agents() {
        let core = EngineCore::start(EngineConfig::default(), Arc::new(InMemoryMetaStore::new()));
        let agent = core.channel_agent();
        assert!(agent.context().get("API").is_none());
    }
}
