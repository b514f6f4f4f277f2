//! Disk-backed deferred execution.
//!
//! Spooled jobs survive a restart: the descriptor on disk is the source of
//! truth and is only deleted after its flow finishes successfully. The
//! manager keeps a fixed set of single-worker lanes and shards jobs onto
//! them by target, so jobs for the same target always run in the order they
//! were enqueued while different targets proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::channel::resolve_flow_definition;
use crate::constants::{context_keys, spool_tags};
use crate::context::Context;
use crate::core::EngineServices;
use crate::error::{Result, SluiceError};
use crate::flow::Flow;
use crate::stream::InputStream;

pub struct SpoolingManager {
    queue: mpsc::UnboundedSender<String>,
}

impl SpoolingManager {
    /// Spawn the dispatcher and its worker lanes.
    pub fn start(services: Arc<EngineServices>) -> Arc<Self> {
        let workers = services.config.spool_workers.max(1);
        let mut lanes = Vec::with_capacity(workers);
        for lane in 0..workers {
            let (tx, mut rx) = mpsc::unbounded_channel::<SpoolJob>();
            let services = services.clone();
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.run(&services, lane).await;
                }
            });
            lanes.push(tx);
        }

        let (queue, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(flow_id) = rx.recv().await {
                match SpoolJob::load(&services, flow_id.clone()).await {
                    Ok(job) => {
                        let lane = lane_for(&job.target, lanes.len());
                        if lanes[lane].send(job).is_err() {
                            tracing::error!(flow = %flow_id, "spool lane closed");
                        }
                    }
                    Err(e) => {
                        // descriptor stays on disk for a later replay
                        tracing::error!(flow = %flow_id, error = %e, "spooled job unreadable");
                    }
                }
            }
        });

        Arc::new(Self { queue })
    }

    /// Hand a persisted job id to the dispatcher.
    pub fn enqueue(&self, flow_id: String) {
        if self.queue.send(flow_id).is_err() {
            tracing::error!("spool queue closed, job will only run after a restart");
        }
    }
}

fn lane_for(target: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    target.hash(&mut hasher);
    (hasher.finish() as usize) % lanes
}

struct SpoolJob {
    flow_id: String,
    target: String,
    context: Context,
    stream: Option<Arc<InputStream>>,
}

impl SpoolJob {
    /// Rebuild a job from its descriptor and, when one was backed up, the
    /// request payload.
    async fn load(services: &EngineServices, flow_id: String) -> Result<Self> {
        let path = services.config.spool_folder.join(&flow_id);
        let raw = tokio::fs::read(&path).await?;
        let descriptor: Value = serde_json::from_slice(&raw)?;

        let target = descriptor
            .get(spool_tags::TARGET)
            .and_then(Value::as_str)
            .ok_or_else(|| SluiceError::Config(format!("spool {flow_id} has no target")))?
            .to_string();
        let saved = descriptor
            .get(spool_tags::CONTEXT)
            .ok_or_else(|| SluiceError::Config(format!("spool {flow_id} has no context")))?;
        let mut context = Context::from_json(saved)?;

        let mut stream = None;
        if let Some(channel_id) = context.get_string(context_keys::CHANNEL_ID) {
            let payload_path = services.config.payload_folder.join(&channel_id);
            match tokio::fs::read(&payload_path).await {
                Ok(bytes) => {
                    let doc: Value = serde_json::from_slice(&bytes)?;
                    context.add(context_keys::REQUEST_BODY, doc.clone());
                    stream = Some(Arc::new(InputStream::single(doc)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(flow = %flow_id, "no payload backup, running without a stream");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Self {
            flow_id,
            target,
            context,
            stream,
        })
    }

    async fn run(self, services: &EngineServices, lane: usize) {
        tracing::info!(flow = %self.flow_id, target = %self.target, lane, "spooled job starting");
        match self.execute(services).await {
            Ok(()) => {
                let path = services.config.spool_folder.join(&self.flow_id);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(flow = %self.flow_id, error = %e, "spool descriptor cleanup failed");
                }
            }
            Err(e) => {
                // keep the descriptor so the job can be replayed
                tracing::error!(flow = %self.flow_id, target = %self.target, error = %e, "spooled job failed");
            }
        }
    }

    async fn execute(&self, services: &EngineServices) -> Result<()> {
        let definition = resolve_flow_definition(services, &self.context, &self.target).await?;
        let mut flow = Flow::prepare(
            self.target.clone(),
            &definition,
            &self.context,
            self.stream.clone(),
        )?;
        flow.process(services).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_assignment_is_stable_per_target() {
        let a = lane_for("IF_A", 4);
        assert_eq!(a, lane_for("IF_A", 4));
        assert!(a < 4);
    }
}
