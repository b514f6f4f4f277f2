//! Carrier: owner of the underlying bytes/records of a stream.
//!
//! A carrier knows how to hand out its content chunk by chunk via
//! [`Carrier::forward`]; the stream layer on top decides when a chunk may
//! advance (see [`super::InputStream`]). Chunks are reference-counted so one
//! fetched chunk can be handed to several subscribers without copying.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;

/// One data record: an ordered JSON object of column -> value.
pub type Record = serde_json::Map<String, Value>;

/// One buffered unit of stream data.
#[derive(Debug, Clone)]
pub enum Chunk {
    Records(Arc<Vec<Record>>),
    Bytes(Arc<Vec<u8>>),
}

impl Chunk {
    pub fn from_records(records: Vec<Record>) -> Self {
        Chunk::Records(Arc::new(records))
    }

    /// Row count for record chunks, byte count for binary chunks.
    pub fn len(&self) -> usize {
        match self {
            Chunk::Records(r) => r.len(),
            Chunk::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Option<&[Record]> {
        match self {
            Chunk::Records(r) => Some(r),
            Chunk::Bytes(_) => None,
        }
    }
}

/// Uniform access to a buffered data source.
pub trait Carrier: Send {
    /// Total number of units the source holds, when known.
    fn total_size(&self) -> u64;

    /// Units not yet fetched by `forward`.
    fn remain_size(&self) -> u64;

    /// Header data accompanying the items, if the source carries any.
    fn header(&self) -> Option<Value>;

    /// True once `forward` has exhausted the source.
    fn is_finished(&self) -> bool;

    /// Fetch the next chunk; `None` once exhausted. I/O errors propagate to
    /// the caller, retry policy belongs to the connector layer.
    fn forward(&mut self) -> Result<Option<Chunk>>;

    /// Full document view of the source, when representable.
    fn snapshot(&self) -> Option<Value>;

    /// Persist the snapshot to a file (payload backup).
    fn flush_to_file(&self, path: &Path) -> Result<()>;

    /// Rewind to the beginning, where supported.
    fn reset(&mut self);
}
