//! One consolidated run: ingest, sort, serialize, compress.

use crate::chunk::ChunkReader;
use crate::config::PipelineConfig;
use crate::error::{Result, ShardError};
use crate::io::shard::{ShardFile, ensure_output_dir, write_shard};
use crate::record::{RandomSecrets, SecretSource};
use crate::scheduler::{CompressionReport, CompressionScheduler, ShutdownSignal};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

/// Input read buffer for [`ShardPipeline::run_file`].
const INPUT_BUFFER: usize = 8 * 1024 * 1024;

/// Outcome of a successful run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Values accepted from the input, before duplicate collapsing.
    pub values_read: u64,
    /// Shards in emission order.
    pub shards: Vec<ShardFile>,
    pub compression: CompressionReport,
    pub elapsed_ms: u64,
}

impl RunReport {
    /// Write the report as pretty JSON.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut w = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut w, self)
            .with_context(|| format!("serialize run report to {}", path.display()))?;
        w.flush()?;
        Ok(())
    }
}

/// Turns an integer stream into compressed shards according to a
/// [`PipelineConfig`].
pub struct ShardPipeline {
    config: PipelineConfig,
    signal: ShutdownSignal,
}

impl ShardPipeline {
    /// # Errors
    /// Returns [`ShardError::Config`] if `config` fails validation.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let signal = ShutdownSignal::new(config.grace_period);
        Ok(Self { config, signal })
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Handle for interrupting the run from another thread.
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Run with random secrets.
    ///
    /// # Errors
    /// See [`ShardPipeline::run_with_secrets`].
    pub fn run(&self, input: impl BufRead) -> Result<RunReport> {
        self.run_with_secrets(input, RandomSecrets)
    }

    /// Open `path` and run over its contents.
    ///
    /// # Errors
    /// Returns [`ShardError::Input`] if the file cannot be opened, otherwise see
    /// [`ShardPipeline::run_with_secrets`].
    pub fn run_file(&self, path: impl AsRef<Path>) -> Result<RunReport> {
        let file = File::open(path.as_ref()).map_err(ShardError::Input)?;
        self.run(BufReader::with_capacity(INPUT_BUFFER, file))
    }

    /// Split `input` into sorted shards numbered from 1, then compress them.
    ///
    /// # Errors
    /// The first parse, serialization or compression failure aborts the run.
    /// Shards compressed before the failure are kept. A shutdown request during
    /// ingestion returns [`ShardError::Interrupted`] before the next chunk is read;
    /// shards already written stay on disk uncompressed.
    pub fn run_with_secrets(
        &self,
        input: impl BufRead,
        mut secrets: impl SecretSource,
    ) -> Result<RunReport> {
        let started = Instant::now();
        ensure_output_dir(&self.config.output_dir)?;

        let mut chunks =
            ChunkReader::new(input, self.config.chunk_capacity, self.config.duplicates)?;
        let mut shards: Vec<ShardFile> = Vec::new();
        loop {
            // checked between shards so every shard on disk is closed
            if self.signal.is_requested() {
                warn!(shards = shards.len(), "shutdown requested, ingestion stopped");
                return Err(ShardError::Interrupted {
                    shards_written: shards.len(),
                });
            }
            let Some(chunk) = chunks.next() else {
                break;
            };
            let chunk = chunk?;
            let index = shards.len() + 1;
            shards.push(write_shard(&chunk, index, &self.config, &mut secrets)?);
        }
        let values_read = chunks.values_read();
        info!(values_read, shards = shards.len(), "input split into shards");

        let scheduler = CompressionScheduler::from_config(&self.config, self.signal.clone())?;
        let paths: Vec<_> = shards.iter().map(|s| s.path.clone()).collect();
        let compression = scheduler.compress_all(&paths)?;

        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(elapsed_ms, shards = shards.len(), "run finished");
        Ok(RunReport {
            values_read,
            shards,
            compression,
            elapsed_ms,
        })
    }
}
