//! Shard file I/O: adaptive JSON serialization and xz compression.

pub mod shard;
pub mod xz;
