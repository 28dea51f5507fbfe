//! Shard compression into `.xz` siblings.
//!
//! [`XzCompressor`] streams one shard file through an LZMA2 encoder configured
//! from [`XzSettings`] (fast mode, bounded dictionary, CRC64 check) and writes
//! `<shard>.xz`. The original is removed only after the encoder has finished and
//! the artifact has been flushed and synced. On failure the original stays in
//! place; the `.xz` path may hold partial output, which the caller removes.

use crate::config::{BufferTiers, XzSettings};
use crate::scheduler::ShutdownSignal;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, trace};
use xz2::read::XzDecoder;
use xz2::stream::{Check, Filters, LzmaOptions, MatchFinder, Mode, Stream};
use xz2::write::XzEncoder;

/// Transfer buffer for the read-encode-write loop.
const TRANSFER_BUFFER: usize = 64 * 1024;
/// Progress is traced every this many input bytes.
const PROGRESS_STEP: u64 = 10 * 1024 * 1024;

/// `<path>.xz`.
#[must_use]
pub fn xz_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".xz");
    PathBuf::from(name)
}

/// Compresses one shard file. Implementations must be callable from several
/// worker threads at once, each with a different shard.
pub trait ShardCompressor: Send + Sync {
    /// Compress `shard` and return the artifact path. The original must be
    /// deleted only on success.
    ///
    /// # Errors
    /// Any I/O failure. Implementations should return
    /// [`io::ErrorKind::Interrupted`] once `signal` reports force-cancellation.
    fn compress(&self, shard: &Path, signal: &ShutdownSignal) -> io::Result<PathBuf>;

    /// Where the artifact for `shard` is written.
    fn artifact_path(&self, shard: &Path) -> PathBuf {
        xz_path(shard)
    }
}

/// LZMA2/xz shard compressor.
#[derive(Clone, Copy, Debug, Default)]
pub struct XzCompressor {
    pub settings: XzSettings,
    pub buffers: BufferTiers,
}

impl XzCompressor {
    #[must_use]
    pub fn new(settings: XzSettings, buffers: BufferTiers) -> Self {
        Self { settings, buffers }
    }

    fn encoder_stream(&self) -> io::Result<Stream> {
        let s = &self.settings;
        let mut opts = LzmaOptions::new_preset(s.preset).map_err(io::Error::other)?;
        opts.dict_size(s.dict_size)
            .literal_context_bits(s.literal_context_bits)
            .literal_position_bits(s.literal_position_bits)
            .position_bits(s.position_bits)
            .mode(Mode::Fast)
            .match_finder(MatchFinder::HashChain4);
        let mut filters = Filters::new();
        filters.lzma2(&opts);
        Stream::new_stream_encoder(&filters, Check::Crc64).map_err(io::Error::other)
    }
}

impl ShardCompressor for XzCompressor {
    fn compress(&self, shard: &Path, signal: &ShutdownSignal) -> io::Result<PathBuf> {
        let started = Instant::now();
        let target = xz_path(shard);
        let size = fs::metadata(shard)?.len();
        let buffer = self.buffers.for_size(size);
        info!(shard = %shard.display(), size, buffer, "compression started");

        let mut input = BufReader::with_capacity(buffer, File::open(shard)?);
        let output = BufWriter::with_capacity(buffer, File::create(&target)?);
        let mut encoder = XzEncoder::new_stream(output, self.encoder_stream()?);

        let mut chunk = vec![0u8; TRANSFER_BUFFER];
        let mut total = 0u64;
        let mut next_report = PROGRESS_STEP;
        loop {
            if signal.is_force_cancelled() {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "compression cancelled after the shutdown grace period",
                ));
            }
            let n = match input.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            encoder.write_all(&chunk[..n])?;
            total += n as u64;
            if total >= next_report {
                trace!(shard = %shard.display(), total, size, "compression progress");
                next_report += PROGRESS_STEP;
            }
        }

        let output = encoder.finish()?;
        let file = output.into_inner().map_err(io::IntoInnerError::into_error)?;
        file.sync_all()?;
        drop(input);

        fs::remove_file(shard)?;
        debug!(shard = %shard.display(), "original shard removed");
        info!(
            artifact = %target.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compression finished"
        );
        Ok(target)
    }
}

/// Decompress an `.xz` artifact into memory.
///
/// # Errors
/// Returns an error if the file cannot be read or is not a valid xz stream.
pub fn decompress_shard(path: &Path) -> io::Result<Vec<u8>> {
    let mut decoder = XzDecoder::new(BufReader::new(File::open(path)?));
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
