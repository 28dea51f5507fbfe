//! Testing utilities for shard runs.
//!
//! - [`SequentialSecrets`]: deterministic secrets, so two serializations of the
//!   same chunk can be compared byte for byte
//! - [`read_shard`] / [`read_compressed_shard`]: parse a shard back, strictly
//!   against the `{"items": [{"id", "secret"}]}` schema
//! - [`number_input`]: an in-memory newline-delimited input stream
//! - [`assert_sorted_ids`] / [`assert_contiguous_shards`]: shard-level assertions
//!
//! # Example
//!
//! ```no_run
//! use shardpack::testing::*;
//! use shardpack::ShardPipeline;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = quiet_config("out");
//! let report = ShardPipeline::new(config)?.run(number_input(&[5, 3, 1, 4, 2]))?;
//! let doc = read_compressed_shard(&report.compression.shards[0].artifact)?;
//! assert_sorted_ids(&doc);
//! # Ok(())
//! # }
//! ```

use crate::config::PipelineConfig;
use crate::io::xz::decompress_shard;
use crate::record::SecretSource;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Shard document as read back from disk.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardDoc {
    pub items: Vec<ShardItem>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardItem {
    pub id: i64,
    pub secret: String,
}

impl ShardDoc {
    #[must_use]
    pub fn ids(&self) -> Vec<i64> {
        self.items.iter().map(|i| i.id).collect()
    }
}

/// Deterministic v4-formatted UUIDs built from a counter.
#[derive(Clone, Debug, Default)]
pub struct SequentialSecrets {
    next: u128,
}

impl SequentialSecrets {
    #[must_use]
    pub fn starting_at(next: u128) -> Self {
        Self { next }
    }
}

impl SecretSource for SequentialSecrets {
    fn next_secret(&mut self) -> Uuid {
        let bytes = self.next.to_be_bytes();
        self.next += 1;
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }
}

/// Newline-delimited input holding `values`.
#[must_use]
pub fn number_input(values: &[i64]) -> Cursor<Vec<u8>> {
    let mut text = String::new();
    for v in values {
        text.push_str(&v.to_string());
        text.push('\n');
    }
    Cursor::new(text.into_bytes())
}

/// Config for tests: output under `dir`, two workers, no stagger, short grace.
#[must_use]
pub fn quiet_config(dir: impl Into<PathBuf>) -> PipelineConfig {
    PipelineConfig {
        worker_count: Some(2),
        stagger: Duration::ZERO,
        grace_period: Duration::from_secs(5),
        stream_buffer: 64 * 1024,
        ..PipelineConfig::with_output_dir(dir)
    }
}

/// Parse an uncompressed shard file.
///
/// # Errors
/// Returns an error if the file cannot be read or does not match the schema.
pub fn read_shard(path: impl AsRef<Path>) -> Result<ShardDoc> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse shard {}", path.display()))
}

/// Decompress and parse a `.xz` shard artifact.
///
/// # Errors
/// Returns an error if the artifact is not valid xz or the JSON does not match the
/// schema.
pub fn read_compressed_shard(path: impl AsRef<Path>) -> Result<ShardDoc> {
    let path = path.as_ref();
    let bytes = decompress_shard(path).with_context(|| format!("decompress {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse shard {}", path.display()))
}

/// Assert that a shard's ids are in ascending order.
///
/// # Panics
/// Panics at the first out-of-order pair.
pub fn assert_sorted_ids(doc: &ShardDoc) {
    for (i, pair) in doc.items.windows(2).enumerate() {
        assert!(
            pair[0].id <= pair[1].id,
            "Shard ids out of order at index {}:\n  {} then {}",
            i + 1,
            pair[0].id,
            pair[1].id
        );
    }
}

/// Assert that `dir` holds shards `1..=count` (as `.json` or `.json.xz`) and no
/// others.
///
/// # Panics
/// Panics if an index is missing or an unexpected shard file is present.
pub fn assert_contiguous_shards(dir: impl AsRef<Path>, count: usize) {
    let dir = dir.as_ref();
    let mut found: Vec<usize> = fs::read_dir(dir)
        .unwrap_or_else(|e| panic!("read_dir {}: {e}", dir.display()))
        .filter_map(|entry| entry.ok()?.file_name().into_string().ok())
        .filter_map(|name| {
            let rest = name.strip_prefix("output_part")?;
            let index = rest
                .strip_suffix(".json.xz")
                .or_else(|| rest.strip_suffix(".json"))?;
            index.parse().ok()
        })
        .collect();
    found.sort_unstable();
    let expected: Vec<usize> = (1..=count).collect();
    assert_eq!(
        found, expected,
        "Shard indices mismatch in {}:\n  Expected: {expected:?}\n  Found: {found:?}",
        dir.display()
    );
}
