//! In-memory record list served in bounded buffers.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::constants::payload_tags;
use crate::error::Result;

use super::carrier::{Carrier, Chunk, Record};

/// Carrier over an owned record list, handing out at most `buffer_size`
/// records per `forward` call.
pub struct RecordPipe {
    header: Option<Value>,
    data: Vec<Record>,
    buffer_size: usize,
    current: usize,
    finished: bool,
}

impl RecordPipe {
    /// Pipe that serves the whole list as a single buffer.
    pub fn new(header: Option<Value>, data: Vec<Record>) -> Self {
        let buffer_size = data.len().max(1);
        Self::with_buffer_size(header, data, buffer_size)
    }

    pub fn with_buffer_size(header: Option<Value>, data: Vec<Record>, buffer_size: usize) -> Self {
        Self {
            header,
            data,
            buffer_size: buffer_size.max(1),
            current: 0,
            finished: false,
        }
    }
}

impl Carrier for RecordPipe {
    fn total_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn remain_size(&self) -> u64 {
        (self.data.len() - self.current) as u64
    }

    fn header(&self) -> Option<Value> {
        self.header.clone()
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn forward(&mut self) -> Result<Option<Chunk>> {
        if self.current >= self.data.len() {
            self.finished = true;
            return Ok(None);
        }
        let end = (self.current + self.buffer_size).min(self.data.len());
        let buffer: Vec<Record> = self.data[self.current..end].to_vec();
        self.current = end;
        Ok(Some(Chunk::Records(Arc::new(buffer))))
    }

    fn snapshot(&self) -> Option<Value> {
        let items: Vec<Value> = self.data.iter().cloned().map(Value::Object).collect();
        Some(serde_json::json!({
            payload_tags::HEADER: self.header.clone().unwrap_or(Value::Null),
            payload_tags::ITEMS: items,
        }))
    }

    fn flush_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let snapshot = self.snapshot().unwrap_or(Value::Null);
        std::fs::write(path, serde_json::to_vec_pretty(&snapshot)?)?;
        Ok(())
    }

    fn reset(&mut self) {
        self.current = 0;
        self.finished = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| json!({"N": i}).as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn forward_respects_buffer_size() {
        let mut pipe = RecordPipe::with_buffer_size(None, rows(7), 3);
        let sizes: Vec<usize> = std::iter::from_fn(|| pipe.forward().unwrap())
            .map(|c| c.len())
            .collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert!(pipe.is_finished());
        assert_eq!(pipe.remain_size(), 0);
    }

    #[test]
    fn reset_rewinds() {
        let mut pipe = RecordPipe::new(None, rows(2));
        assert_eq!(pipe.forward().unwrap().unwrap().len(), 2);
        assert!(pipe.forward().unwrap().is_none());
        pipe.reset();
        assert_eq!(pipe.forward().unwrap().unwrap().len(), 2);
    }
}
