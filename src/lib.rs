//! # Shardpack
//!
//! Converts one very large newline-delimited file of integers into independently
//! sorted, JSON-serialized, xz-compressed shard files while bounding peak memory and
//! concurrent I/O.
//!
//! ## Pipeline
//!
//! 1. **Chunk reader/sorter** ([`chunk`]) reads decimal `i64` values into chunks of
//!    `chunk_capacity` and sorts each one ascending.
//! 2. **Adaptive serializer** ([`io::shard`]) writes each chunk as
//!    `output_part<N>.json` (`N` = 1, 2, 3, ...), pairing every id with a random
//!    UUID v4 secret. Shards whose size estimate fits under the mapping cap are
//!    written through a memory map; larger ones are streamed. The output bytes are
//!    the same either way.
//! 3. **Compression scheduler** ([`scheduler`]) orders shards largest-first and
//!    compresses them in batches of `worker_count`, joining each batch before the
//!    next starts.
//! 4. **Compressor** ([`io::xz`]) streams a shard through LZMA2 into
//!    `<shard>.xz` and removes the original on success.
//!
//! ## Quick Start
//!
//! ```no_run
//! use shardpack::{PipelineConfig, ShardPipeline};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = PipelineConfig {
//!     chunk_capacity: 100_000,
//!     ..PipelineConfig::with_output_dir("output")
//! };
//! let report = ShardPipeline::new(config)?.run_file("file.txt")?;
//! println!("{} shards in {} ms", report.shards.len(), report.elapsed_ms);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `mmap` (default) - memory-mapped shard output below the mapping cap. Without
//!   it every shard is streamed.
//!
//! ## Module Overview
//!
//! - [`config`] - run configuration and its defaults
//! - [`chunk`] - chunked ingestion and sort
//! - [`io`] - shard serialization and compression
//! - [`scheduler`] - batched compression with a shutdown signal
//! - [`pipeline`] - one full run and its report
//! - [`generate`] - input file generation
//! - [`testing`] - fixtures and assertions for tests

pub mod chunk;
pub mod config;
pub mod error;
pub mod generate;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod record;
pub mod scheduler;
pub mod testing;

pub use chunk::{Chunk, ChunkReader};
pub use config::{BufferTiers, DuplicatePolicy, PipelineConfig, SizeEstimate, XzSettings};
pub use error::ShardError;
pub use io::shard::{ShardFile, ShardWriter, WriteMode, write_shard};
pub use io::xz::{ShardCompressor, XzCompressor};
pub use pipeline::{RunReport, ShardPipeline};
pub use record::{RandomSecrets, Record, SecretSource};
pub use scheduler::{CompressionReport, CompressionScheduler, ShutdownSignal};
