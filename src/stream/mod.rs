//! Broadcast input streams.
//!
//! An [`InputStream`] sits between a data source (a [`Carrier`]) and one or
//! more consumers. Each consumer holds a [`Payload`] handle obtained from
//! [`InputStream::subscribe`] and pulls chunks through [`InputStream::next`].
//!
//! Two modes exist:
//!
//! * **shared** - the carrier is advanced at most once per chunk. A new chunk
//!   is fetched only after every live subscriber has taken the current one;
//!   a subscriber that is ahead of the group sees [`StreamNext::NotReady`]
//!   until the others catch up. Unsubscribing removes a consumer from that
//!   accounting, so stragglers cannot stall the group forever.
//! * **single** - a pre-materialized document handed out exactly once per
//!   subscriber. Used for results that bypass buffering entirely.
//!
//! Consumers take turns on one task; the internal mutex exists so the stream
//! can be held in `Arc` across await points, not for concurrent `next` calls.

mod carrier;
mod record_pipe;

pub use carrier::{Carrier, Chunk, Record};
pub use record_pipe::RecordPipe;

use std::path::Path;

use parking_lot::Mutex;
use serde_json::Value;

use crate::constants::payload_tags;
use crate::error::Result;

/// Outcome of one [`InputStream::next`] call.
#[derive(Debug, Clone)]
pub enum StreamNext {
    /// The next chunk for this subscriber.
    Chunk(Chunk),
    /// This subscriber already took the current chunk and the group has not
    /// finished it yet.
    NotReady,
    /// The source is exhausted.
    Finished,
}

impl StreamNext {
    pub fn chunk(self) -> Option<Chunk> {
        match self {
            StreamNext::Chunk(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, StreamNext::Finished)
    }
}

/// One subscriber's handle on an [`InputStream`].
#[derive(Debug)]
pub struct Payload {
    id: u64,
    /// Serial of the last chunk this subscriber took.
    seen: u64,
    /// Units pulled through this handle so far.
    read_length: u64,
}

impl Payload {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn read_length(&self) -> u64 {
        self.read_length
    }
}

enum Source {
    Shared(Box<dyn Carrier>),
    Single {
        chunk: Option<Chunk>,
        header: Option<Value>,
        doc: Value,
    },
}

struct StreamState {
    source: Source,
    /// Chunk currently being distributed, shared mode only.
    current: Option<Chunk>,
    /// Serial of `current`; starts at 0, each fetch increments.
    serial: u64,
    /// Subscribers that took `current`.
    done: usize,
    /// Subscribers not yet unsubscribed.
    live: usize,
    next_id: u64,
    finished: bool,
}

/// A broadcast stream over one data source.
pub struct InputStream {
    state: Mutex<StreamState>,
}

impl InputStream {
    /// Shared stream over a carrier; chunks advance per the group protocol.
    pub fn shared(carrier: Box<dyn Carrier>) -> Self {
        Self {
            state: Mutex::new(StreamState {
                source: Source::Shared(carrier),
                current: None,
                serial: 0,
                done: 0,
                live: 0,
                next_id: 0,
                finished: false,
            }),
        }
    }

    /// Single-shot stream over a materialized document. Each subscriber gets
    /// the whole content once; the group protocol does not apply.
    pub fn single(doc: Value) -> Self {
        let chunk = doc
            .get(payload_tags::ITEMS)
            .and_then(Value::as_array)
            .and_then(|items| {
                items
                    .iter()
                    .map(|v| v.as_object().cloned())
                    .collect::<Option<Vec<Record>>>()
            })
            .map(Chunk::from_records);
        let header = doc.get(payload_tags::HEADER).cloned();
        Self {
            state: Mutex::new(StreamState {
                source: Source::Single { chunk, header, doc },
                current: None,
                serial: 0,
                done: 0,
                live: 0,
                next_id: 0,
                finished: false,
            }),
        }
    }

    pub fn subscribe(&self) -> Payload {
        let mut state = self.state.lock();
        state.live += 1;
        state.next_id += 1;
        Payload {
            id: state.next_id,
            seen: 0,
            read_length: 0,
        }
    }

    /// Remove a subscriber from the group accounting. In shared mode this may
    /// unblock the remaining subscribers.
    pub fn unsubscribe(&self, payload: Payload) {
        let mut state = self.state.lock();
        if state.live > 0 {
            state.live -= 1;
        }
        if payload.seen == state.serial && state.done > 0 {
            state.done -= 1;
        }
    }

    /// Pull the next chunk for `payload`.
    pub fn next(&self, payload: &mut Payload) -> Result<StreamNext> {
        let mut state = self.state.lock();

        match &mut state.source {
            Source::Single { chunk, .. } => {
                if payload.seen > 0 {
                    return Ok(StreamNext::Finished);
                }
                payload.seen = 1;
                match chunk.clone() {
                    Some(c) => {
                        payload.read_length += c.len() as u64;
                        Ok(StreamNext::Chunk(c))
                    }
                    None => Ok(StreamNext::Finished),
                }
            }
            Source::Shared(_) => {
                // Current chunk not yet taken by this subscriber.
                if payload.seen < state.serial {
                    let chunk = match state.current.clone() {
                        Some(c) => c,
                        None => return Ok(StreamNext::Finished),
                    };
                    payload.seen = state.serial;
                    payload.read_length += chunk.len() as u64;
                    state.done += 1;
                    return Ok(StreamNext::Chunk(chunk));
                }

                if state.finished {
                    return Ok(StreamNext::Finished);
                }

                // This subscriber is ahead; only advance once the whole
                // group took the current chunk.
                if state.current.is_some() && state.done < state.live {
                    return Ok(StreamNext::NotReady);
                }

                let fetched = match &mut state.source {
                    Source::Shared(carrier) => carrier.forward()?,
                    Source::Single { .. } => unreachable!(),
                };
                match fetched {
                    Some(chunk) if !chunk.is_empty() => {
                        state.serial += 1;
                        state.current = Some(chunk.clone());
                        state.done = 1;
                        payload.seen = state.serial;
                        payload.read_length += chunk.len() as u64;
                        Ok(StreamNext::Chunk(chunk))
                    }
                    _ => {
                        state.finished = true;
                        state.current = None;
                        Ok(StreamNext::Finished)
                    }
                }
            }
        }
    }

    /// Total unit count of the source, when known.
    pub fn size(&self) -> u64 {
        let state = self.state.lock();
        match &state.source {
            Source::Shared(carrier) => carrier.total_size(),
            Source::Single { chunk, .. } => {
                chunk.as_ref().map(|c| c.len() as u64).unwrap_or(0)
            }
        }
    }

    pub fn header(&self) -> Option<Value> {
        let state = self.state.lock();
        match &state.source {
            Source::Shared(carrier) => carrier.header(),
            Source::Single { header, .. } => header.clone(),
        }
    }

    /// Full document view, when the source can represent one.
    pub fn snapshot(&self) -> Option<Value> {
        let state = self.state.lock();
        match &state.source {
            Source::Shared(carrier) => carrier.snapshot(),
            Source::Single { doc, .. } => Some(doc.clone()),
        }
    }

    /// Persist the document view to a file (payload backup).
    pub fn flush_to_file(&self, path: &Path) -> Result<()> {
        let state = self.state.lock();
        match &state.source {
            Source::Shared(carrier) => carrier.flush_to_file(path),
            Source::Single { doc, .. } => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, serde_json::to_vec_pretty(doc)?)?;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for InputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InputStream")
            .field("serial", &state.serial)
            .field("live", &state.live)
            .field("finished", &state.finished)
            .finish_non_exhaustive()
    }
}
