//! Chunked ingestion of a newline-delimited integer stream.
//!
//! [`ChunkReader`] reads decimal `i64` values one line at a time, skipping blank
//! lines, and yields a sorted [`Chunk`] every `capacity` values plus a final,
//! possibly smaller chunk at end of stream. A line that does not parse ends the
//! iteration with [`ShardError::Parse`].

use crate::config::DuplicatePolicy;
use crate::error::{Result, ShardError};
use std::io::BufRead;

/// A sorted block of values bound for one shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    values: Vec<i64>,
}

impl Chunk {
    /// Sort `values` ascending and apply `policy`.
    #[must_use]
    pub fn sorted(mut values: Vec<i64>, policy: DuplicatePolicy) -> Self {
        values.sort_unstable();
        if policy == DuplicatePolicy::Collapse {
            values.dedup();
        }
        Self { values }
    }

    #[must_use]
    pub fn values(&self) -> &[i64] {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn into_values(self) -> Vec<i64> {
        self.values
    }
}

/// Iterator of sorted chunks over a line-oriented reader.
pub struct ChunkReader<R> {
    reader: R,
    capacity: usize,
    policy: DuplicatePolicy,
    line: Vec<u8>,
    line_no: u64,
    values_read: u64,
    done: bool,
}

impl<R: BufRead> ChunkReader<R> {
    /// # Errors
    /// Returns [`ShardError::Config`] if `capacity` is zero.
    pub fn new(reader: R, capacity: usize, policy: DuplicatePolicy) -> Result<Self> {
        if capacity == 0 {
            return Err(ShardError::Config("chunk_capacity must be at least 1".into()));
        }
        Ok(Self {
            reader,
            capacity,
            policy,
            line: Vec::new(),
            line_no: 0,
            values_read: 0,
            done: false,
        })
    }

    /// Values accepted so far, before any duplicate collapsing.
    pub fn values_read(&self) -> u64 {
        self.values_read
    }

    /// Next parsed value, or `None` at end of stream.
    fn next_value(&mut self) -> Result<Option<i64>> {
        loop {
            self.line.clear();
            let n = self
                .reader
                .read_until(b'\n', &mut self.line)
                .map_err(ShardError::Input)?;
            if n == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            let line_no = self.line_no;
            let text = match std::str::from_utf8(&self.line) {
                Ok(text) => text,
                Err(source) => {
                    return Err(ShardError::Parse {
                        line: line_no,
                        content: String::from_utf8_lossy(&self.line).trim().to_string(),
                        source: source.into(),
                    });
                }
            };
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value = trimmed.parse::<i64>().map_err(|source| ShardError::Parse {
                line: line_no,
                content: trimmed.to_string(),
                source: source.into(),
            })?;
            self.values_read += 1;
            return Ok(Some(value));
        }
    }

    fn fill(&mut self) -> Result<Option<Chunk>> {
        let mut buffer = Vec::with_capacity(self.capacity.min(1 << 20));
        while buffer.len() < self.capacity {
            match self.next_value()? {
                Some(v) => buffer.push(v),
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if buffer.is_empty() {
            return Ok(None);
        }
        Ok(Some(Chunk::sorted(buffer, self.policy)))
    }
}

impl<R: BufRead> Iterator for ChunkReader<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fill() {
            Ok(chunk) => chunk.map(Ok),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
