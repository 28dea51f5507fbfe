//! Run configuration.
//!
//! [`PipelineConfig`] carries every tuning knob of a run: chunk capacity, the
//! mapping cap, worker margin, and the buffer sizes used by the serializer and the
//! compressor. All fields are public and the struct is serde-serializable so the
//! binary can load it from a JSON file.

use crate::error::{Result, ShardError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// How repeated values inside one chunk are handled.
///
/// `Preserve` keeps every value, so every full shard holds exactly
/// `chunk_capacity` items. `Collapse` removes repeats after sorting, so a shard
/// holds `chunk_capacity` minus the duplicates seen in its chunk. Chunk
/// boundaries are counted in raw input values either way, and values repeated
/// across two chunks are never collapsed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    Preserve,
    Collapse,
}

/// Conservative byte-size estimate for one shard:
/// `count * per_record_bound + fixed_overhead`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeEstimate {
    /// Upper bound on one pretty-printed item: a 20-character id, a 36-character
    /// UUID, field names, indentation and punctuation come to about 105 bytes.
    pub per_record_bound: u64,
    /// Document framing plus slack.
    pub fixed_overhead: u64,
}

impl Default for SizeEstimate {
    fn default() -> Self {
        Self {
            per_record_bound: 150,
            fixed_overhead: 50_000,
        }
    }
}

impl SizeEstimate {
    /// Estimated byte size of a shard holding `count` records. Saturates instead of
    /// overflowing, which pushes huge shards onto the streamed path.
    #[must_use]
    pub fn for_count(&self, count: usize) -> u64 {
        (count as u64)
            .saturating_mul(self.per_record_bound)
            .saturating_add(self.fixed_overhead)
    }
}

/// I/O buffer size chosen from the shard file size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferTiers {
    pub small_below: u64,
    pub medium_below: u64,
    pub small: usize,
    pub medium: usize,
    pub large: usize,
}

impl Default for BufferTiers {
    fn default() -> Self {
        Self {
            small_below: 10 * MIB,
            medium_below: 100 * MIB,
            small: 512 * KIB as usize,
            medium: 2 * MIB as usize,
            large: 8 * MIB as usize,
        }
    }
}

impl BufferTiers {
    #[must_use]
    pub fn for_size(&self, file_size: u64) -> usize {
        if file_size < self.small_below {
            self.small
        } else if file_size < self.medium_below {
            self.medium
        } else {
            self.large
        }
    }
}

/// LZMA2 encoder settings for shard compression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XzSettings {
    pub preset: u32,
    pub dict_size: u32,
    pub literal_context_bits: u32,
    pub literal_position_bits: u32,
    pub position_bits: u32,
}

impl Default for XzSettings {
    fn default() -> Self {
        Self {
            preset: 4,
            dict_size: 32 * MIB as u32,
            literal_context_bits: 3,
            literal_position_bits: 0,
            position_bits: 2,
        }
    }
}

/// Configuration for one [`ShardPipeline`](crate::ShardPipeline) run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory receiving `output_part<N>.json` and its `.xz` sibling.
    pub output_dir: PathBuf,
    /// Raw values per chunk.
    pub chunk_capacity: usize,
    pub duplicates: DuplicatePolicy,
    pub estimate: SizeEstimate,
    /// Largest estimated shard size written through a memory map.
    pub mapping_cap: u64,
    /// Records materialized at a time while serializing a shard.
    pub write_batch: usize,
    /// Buffer size of the streamed serializer.
    pub stream_buffer: usize,
    /// Cores left idle by the compression pool.
    pub worker_margin: usize,
    /// Fixed compression worker count; derived from parallelism when `None`.
    pub worker_count: Option<usize>,
    /// Delay between task submissions within a batch.
    #[serde(with = "millis")]
    pub stagger: Duration,
    /// How long in-flight tasks may keep running after a shutdown request.
    #[serde(with = "millis")]
    pub grace_period: Duration,
    pub buffer_tiers: BufferTiers,
    pub xz: XzSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            chunk_capacity: 1_000_000,
            duplicates: DuplicatePolicy::Preserve,
            estimate: SizeEstimate::default(),
            mapping_cap: GIB,
            write_batch: 1_000,
            stream_buffer: 8 * MIB as usize,
            worker_margin: 3,
            worker_count: None,
            stagger: Duration::from_millis(100),
            grace_period: Duration::from_secs(60),
            buffer_tiers: BufferTiers::default(),
            xz: XzSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Default configuration writing into `output_dir`.
    pub fn with_output_dir(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    /// Check the knobs that would make a run impossible.
    ///
    /// # Errors
    /// Returns [`ShardError::Config`] for a zero chunk capacity, a zero write
    /// batch, or a zero worker count override.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_capacity == 0 {
            return Err(ShardError::Config("chunk_capacity must be at least 1".into()));
        }
        if self.write_batch == 0 {
            return Err(ShardError::Config("write_batch must be at least 1".into()));
        }
        if self.worker_count == Some(0) {
            return Err(ShardError::Config("worker_count must be at least 1".into()));
        }
        Ok(())
    }

    /// Compression worker count: the override if set, otherwise
    /// `max(1, available_parallelism - worker_margin)`.
    #[must_use]
    pub fn resolved_worker_count(&self) -> usize {
        self.worker_count
            .unwrap_or_else(|| worker_count_for(num_cpus::get(), self.worker_margin))
    }
}

/// `max(1, cores - margin)`.
#[must_use]
pub fn worker_count_for(cores: usize, margin: usize) -> usize {
    cores.saturating_sub(margin).max(1)
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
