//! Error type shared by every stage of a run.
//!
//! Each variant maps to one failure class of the pipeline. Size estimation never
//! fails: an estimate above the mapping cap selects streamed output instead (see
//! [`WriteMode::select`](crate::io::shard::WriteMode::select)).

use std::error::Error as StdError;
use std::io;
use std::path::{Path, PathBuf};

/// Errors raised while turning an integer stream into compressed shards.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// A non-blank input line is not a decimal 64-bit integer, or not UTF-8.
    #[error("line {line}: {content:?} is not a 64-bit integer")]
    Parse {
        /// 1-based line number in the input stream.
        line: u64,
        /// The trimmed line content, lossily decoded.
        content: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    /// The injected input stream failed while reading.
    #[error("failed to read input stream")]
    Input(#[source] io::Error),
    /// The output directory could not be created.
    #[error("failed to create output directory {}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Writing a shard failed. The partial shard file has already been removed.
    #[error("failed to write shard {}", path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Compressing a shard failed, was interrupted, or the task panicked.
    /// The original shard file is left in place.
    #[error("failed to compress shard {}", path.display())]
    Compression {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Shutdown was requested while the input was still being split.
    #[error("interrupted after writing {shards_written} shards")]
    Interrupted { shards_written: usize },
    /// The pipeline configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ShardError {
    /// The shard this failure belongs to, if any.
    pub fn shard_path(&self) -> Option<&Path> {
        match self {
            Self::Serialization { path, .. } | Self::Compression { path, .. } => Some(path),
            _ => None,
        }
    }

    /// True when the failure came from an interrupt rather than an I/O fault.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Interrupted { .. } => true,
            Self::Compression { source, .. } => source.kind() == io::ErrorKind::Interrupted,
            _ => false,
        }
    }
}

pub type Result<T, E = ShardError> = std::result::Result<T, E>;
