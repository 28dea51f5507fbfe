//! Batched parallel compression of shard files.
//!
//! Shards are ordered largest-first and cut into batches of exactly
//! `worker_count` shards (the last batch may be smaller). Each batch runs on a
//! fixed-size `rayon` pool inside a scope, and the scope's return is a hard
//! barrier: no task of batch K+1 starts while a task of batch K is still running.
//! That caps open files, I/O bandwidth and transient memory at one batch.
//!
//! Failure policy: every task of a failing batch still runs to completion, the
//! first failure observed becomes the batch outcome, and no later batch starts.
//! Panicking tasks are reported as compression failures. Partial `.xz` artifacts
//! of failed tasks are removed.
//!
//! Interrupts go through [`ShutdownSignal`]: once requested no further batch or
//! task is started; tasks already running may finish until the grace period
//! elapses, after which they are force-cancelled.

use crate::config::PipelineConfig;
use crate::error::{Result, ShardError};
use crate::io::xz::{ShardCompressor, XzCompressor};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cooperative interrupt shared between the coordinator and running tasks.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug)]
struct SignalInner {
    requested: AtomicBool,
    requested_at: OnceLock<Instant>,
    grace: Duration,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl ShutdownSignal {
    /// A signal whose running tasks are force-cancelled `grace` after a request.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                requested: AtomicBool::new(false),
                requested_at: OnceLock::new(),
                grace,
            }),
        }
    }

    /// Request shutdown. Idempotent; the first request starts the grace period.
    pub fn request(&self) {
        self.inner.requested_at.get_or_init(Instant::now);
        self.inner.requested.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    /// True once a request is older than the grace period.
    #[must_use]
    pub fn is_force_cancelled(&self) -> bool {
        self.is_requested()
            && self
                .inner
                .requested_at
                .get()
                .is_some_and(|at| at.elapsed() >= self.inner.grace)
    }

    #[must_use]
    pub fn grace_period(&self) -> Duration {
        self.inner.grace
    }
}

/// A shard waiting for compression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingShard {
    pub path: PathBuf,
    pub bytes: u64,
    /// Position in the producer's emission order.
    pub position: usize,
}

/// Order `shards` by descending size (ties keep emission order) and cut them into
/// batches of `worker_count`.
#[must_use]
pub fn plan_batches(mut shards: Vec<PendingShard>, worker_count: usize) -> Vec<Vec<PendingShard>> {
    shards.sort_by(|a, b| b.bytes.cmp(&a.bytes).then(a.position.cmp(&b.position)));
    shards
        .chunks(worker_count.max(1))
        .map(<[PendingShard]>::to_vec)
        .collect()
}

/// One successfully compressed shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedShard {
    pub shard: PathBuf,
    pub artifact: PathBuf,
    pub original_bytes: u64,
    /// Zero when the artifact size could not be read back.
    pub compressed_bytes: u64,
    /// 1-based batch the shard was compressed in.
    pub batch: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionReport {
    pub worker_count: usize,
    pub batches: usize,
    pub shards: Vec<CompressedShard>,
}

/// Drives a [`ShardCompressor`] over shard files in size-ordered batches.
pub struct CompressionScheduler {
    pool: Option<rayon::ThreadPool>,
    worker_count: usize,
    stagger: Duration,
    compressor: Arc<dyn ShardCompressor>,
    signal: ShutdownSignal,
}

impl CompressionScheduler {
    /// Start a pool of `worker_count` threads.
    ///
    /// # Errors
    /// Returns [`ShardError::Config`] for a zero worker count or when the pool
    /// threads cannot be spawned.
    pub fn new(
        worker_count: usize,
        compressor: Arc<dyn ShardCompressor>,
        signal: ShutdownSignal,
    ) -> Result<Self> {
        if worker_count == 0 {
            return Err(ShardError::Config("worker_count must be at least 1".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_count)
            .thread_name(|i| format!("shardpack-compress-{i}"))
            .build()
            .map_err(|e| ShardError::Config(format!("failed to start compression pool: {e}")))?;
        Ok(Self {
            pool: Some(pool),
            worker_count,
            stagger: Duration::ZERO,
            compressor,
            signal,
        })
    }

    /// Scheduler with an [`XzCompressor`], worker count and stagger taken from
    /// `config`.
    ///
    /// # Errors
    /// See [`CompressionScheduler::new`].
    pub fn from_config(config: &PipelineConfig, signal: ShutdownSignal) -> Result<Self> {
        let compressor = XzCompressor::new(config.xz, config.buffer_tiers);
        Ok(Self::new(config.resolved_worker_count(), Arc::new(compressor), signal)?
            .with_stagger(config.stagger))
    }

    /// Delay between task submissions inside a batch.
    #[must_use]
    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    #[must_use]
    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }

    /// Compress every shard in `shards`, batch by batch.
    ///
    /// Shards compressed by batches that finished before a failure stay
    /// compressed.
    ///
    /// # Errors
    /// Returns the first [`ShardError::Compression`] of the failing batch, or an
    /// interrupted compression error when shutdown was requested.
    pub fn compress_all(&self, shards: &[PathBuf]) -> Result<CompressionReport> {
        let mut report = CompressionReport {
            worker_count: self.worker_count,
            ..CompressionReport::default()
        };
        if shards.is_empty() {
            return Ok(report);
        }

        let pending = shards
            .iter()
            .enumerate()
            .map(|(position, path)| {
                let bytes = fs::metadata(path)
                    .map_err(|source| ShardError::Compression {
                        path: path.clone(),
                        source,
                    })?
                    .len();
                Ok(PendingShard {
                    path: path.clone(),
                    bytes,
                    position,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let batches = plan_batches(pending, self.worker_count);
        let total = batches.len();
        info!(
            workers = self.worker_count,
            shards = shards.len(),
            batches = total,
            "compressing shards"
        );

        for (i, batch) in batches.iter().enumerate() {
            let number = i + 1;
            if self.signal.is_requested() {
                return Err(interrupted(
                    &batch[0].path,
                    "shutdown requested before the batch started",
                ));
            }
            info!(batch = number, of = total, size = batch.len(), "batch started");
            let done = self.run_batch(number, batch)?;
            report.shards.extend(done);
            report.batches = number;
            info!(batch = number, of = total, "batch finished");
        }
        Ok(report)
    }

    /// Run one batch to completion; returns once every task has finished.
    fn run_batch(&self, number: usize, batch: &[PendingShard]) -> Result<Vec<CompressedShard>> {
        let Some(pool) = self.pool.as_ref() else {
            return Err(interrupted(&batch[0].path, "compression pool already shut down"));
        };
        let compressor: &dyn ShardCompressor = self.compressor.as_ref();
        let signal = &self.signal;
        let done = Mutex::new(Vec::with_capacity(batch.len()));
        let failure: Mutex<Option<ShardError>> = Mutex::new(None);

        pool.in_place_scope(|scope| {
            for (i, shard) in batch.iter().enumerate() {
                if i > 0 && !self.stagger.is_zero() {
                    thread::sleep(self.stagger);
                }
                if signal.is_requested() {
                    record_failure(
                        &failure,
                        interrupted(&shard.path, "shutdown requested before the task started"),
                    );
                    break;
                }
                let (done, failure) = (&done, &failure);
                scope.spawn(move |_| {
                    match run_task(compressor, shard, signal) {
                        Ok(artifact) => {
                            let compressed_bytes = match fs::metadata(&artifact) {
                                Ok(meta) => meta.len(),
                                Err(e) => {
                                    warn!(artifact = %artifact.display(), error = %e, "artifact size unavailable");
                                    0
                                }
                            };
                            done.lock().unwrap_or_else(PoisonError::into_inner).push(
                                CompressedShard {
                                    shard: shard.path.clone(),
                                    artifact,
                                    original_bytes: shard.bytes,
                                    compressed_bytes,
                                    batch: number,
                                },
                            );
                        }
                        Err(source) => {
                            warn!(shard = %shard.path.display(), error = %source, "compression failed");
                            discard_artifact(&compressor.artifact_path(&shard.path));
                            record_failure(
                                failure,
                                ShardError::Compression {
                                    path: shard.path.clone(),
                                    source,
                                },
                            );
                        }
                    }
                });
            }
        });

        if let Some(err) = failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(err);
        }
        Ok(done.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    /// Release the worker pool. Idempotent, and also run on drop.
    ///
    /// Batches are joined before `compress_all` returns, so the pool is idle here;
    /// tasks still running after an interrupt are bounded by the signal's grace
    /// period.
    pub fn shutdown(&mut self) {
        if self.pool.take().is_some() {
            debug!(workers = self.worker_count, "compression pool released");
        }
    }
}

impl Drop for CompressionScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_task(
    compressor: &dyn ShardCompressor,
    shard: &PendingShard,
    signal: &ShutdownSignal,
) -> io::Result<PathBuf> {
    panic::catch_unwind(AssertUnwindSafe(|| compressor.compress(&shard.path, signal)))
        .unwrap_or_else(|payload| {
            Err(io::Error::other(format!(
                "compression task panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn record_failure(slot: &Mutex<Option<ShardError>>, err: ShardError) {
    let mut first = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if first.is_none() {
        *first = Some(err);
    }
}

fn discard_artifact(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(artifact = %path.display(), "partial artifact removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(artifact = %path.display(), error = %e, "could not remove partial artifact"),
    }
}

fn interrupted(path: &Path, reason: &str) -> ShardError {
    ShardError::Compression {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::Interrupted, reason.to_string()),
    }
}
