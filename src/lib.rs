//! sluice-core: an embeddable integration engine.
//!
//! Data moves between databases, files and FTP endpoints through configured
//! flows. An inbound request enters through a [`channel::ChannelAgent`],
//! which fans it out to one or more target flows. Each [`flow::Flow`] walks
//! a chain of modules; a module drives one [`connector::Connector`] through
//! its lifecycle (connect, act, commit or rollback, close), mapping records
//! with [`rule::MappingRule`]s and rendering output documents through a
//! [`template::DocumentTemplate`].
//!
//! Streaming is pull-based: a [`stream::InputStream`] broadcasts buffered
//! chunks to every subscribed consumer and only fetches the next chunk once
//! all of them have taken the current one. Flows marked for spooling are
//! persisted to disk and replayed by the [`spool::SpoolingManager`], which
//! keeps per-target ordering.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sluice_core::config::EngineConfig;
//! use sluice_core::core::EngineCore;
//! use sluice_core::meta::InMemoryMetaStore;
//!
//! # async fn run() -> sluice_core::error::Result<()> {
//! let core = EngineCore::start(EngineConfig::default(), Arc::new(InMemoryMetaStore::new()));
//! let mut agent = core.channel_agent();
//! agent.add_context("REQUEST_PATH_VARIABLES", serde_json::json!({ "target": "IF_A" }));
//! let result = agent.process(None, "orders").await?;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod connector;
pub mod constants;
pub mod context;
pub mod core;
pub mod error;
pub mod flow;
pub mod handler;
pub mod logging;
pub mod meta;
pub mod rule;
pub mod security;
pub mod spool;
pub mod stream;
pub mod template;

pub use channel::{ChannelAgent, ChannelJob};
pub use config::EngineConfig;
pub use context::Context;
pub use core::{EngineCore, EngineServices};
pub use error::{Result, SluiceError};
pub use flow::Flow;
pub use stream::{InputStream, Payload, StreamNext};
