//! Adaptive shard serialization.
//!
//! A sorted [`Chunk`] becomes one pretty-printed JSON document
//! `{"items": [{"id": .., "secret": ..}, ..]}` at `output_part<N>.json`.
//!
//! Two interchangeable [`ShardWriter`] strategies produce the bytes:
//! - [`MappedWriter`] (feature `mmap`) pre-grows the file to the size estimate,
//!   serializes into a writable memory map, then truncates to the bytes written.
//! - [`StreamedWriter`] serializes through a buffered file stream.
//!
//! [`WriteMode::select`] picks one from the estimate and the mapping cap. Both
//! strategies are fed by the same serializer, so the choice never shows in the
//! output. On any failure the partial file is removed before the error returns.

use crate::chunk::Chunk;
use crate::config::PipelineConfig;
use crate::error::{Result, ShardError};
use crate::record::{Record, SecretSource};
use serde::ser::{SerializeSeq, SerializeStruct};
use serde::{Serialize, Serializer};
use std::cell::RefCell;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of shard `index` (1-based).
#[must_use]
pub fn shard_file_name(index: usize) -> String {
    format!("output_part{index}.json")
}

/// Path of shard `index` inside `dir`.
#[must_use]
pub fn shard_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(shard_file_name(index))
}

/// Create `dir` (and parents) if it does not exist.
///
/// # Errors
/// Returns [`ShardError::OutputDir`] if the directory cannot be created.
pub fn ensure_output_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|source| ShardError::OutputDir {
        path: dir.to_path_buf(),
        source,
    })
}

/// How a shard's bytes reach the disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Mapped,
    Streamed,
}

impl WriteMode {
    /// `Mapped` when the estimate fits under `mapping_cap`, else `Streamed`.
    #[must_use]
    pub fn select(estimate: u64, mapping_cap: u64) -> Self {
        if cfg!(feature = "mmap") && estimate > 0 && estimate <= mapping_cap {
            Self::Mapped
        } else {
            Self::Streamed
        }
    }
}

/// A closed shard file, ready for compression.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ShardFile {
    pub index: usize,
    pub path: PathBuf,
    pub items: usize,
    pub bytes: u64,
    pub mode: WriteMode,
}

/// Serializer body handed to a [`ShardWriter`]. It writes the complete document.
pub type ShardBody<'a> = dyn FnMut(&mut dyn Write) -> io::Result<()> + 'a;

/// Strategy that owns the file handle while a shard body is written.
pub trait ShardWriter {
    fn mode(&self) -> WriteMode;

    /// Create `path`, run `body` against it, and return the final file length.
    ///
    /// `estimate` is an upper bound on the body's output length.
    fn write(&self, path: &Path, estimate: u64, body: &mut ShardBody<'_>) -> io::Result<u64>;
}

/// Buffered, unmapped output.
#[derive(Clone, Copy, Debug)]
pub struct StreamedWriter {
    pub buffer_size: usize,
}

impl ShardWriter for StreamedWriter {
    fn mode(&self) -> WriteMode {
        WriteMode::Streamed
    }

    fn write(&self, path: &Path, _estimate: u64, body: &mut ShardBody<'_>) -> io::Result<u64> {
        let file = File::create(path)?;
        let mut w = BufWriter::with_capacity(self.buffer_size.max(1), file);
        body(&mut w)?;
        w.flush()?;
        let file = w.into_inner().map_err(io::IntoInnerError::into_error)?;
        Ok(file.metadata()?.len())
    }
}

/// Output into a writable memory map sized by the estimate.
#[cfg(feature = "mmap")]
#[derive(Clone, Copy, Debug, Default)]
pub struct MappedWriter;

#[cfg(feature = "mmap")]
impl ShardWriter for MappedWriter {
    fn mode(&self) -> WriteMode {
        WriteMode::Mapped
    }

    fn write(&self, path: &Path, estimate: u64, body: &mut ShardBody<'_>) -> io::Result<u64> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(estimate)?;

        let written = {
            // SAFETY: the file was just created and truncated by this call, and the
            // handle never leaves it, so nothing else maps or resizes it meanwhile.
            let mut map = unsafe { memmap2::MmapMut::map_mut(&file)? };
            let mut cursor = io::Cursor::new(&mut map[..]);
            body(&mut cursor).map_err(|e| {
                if e.kind() == io::ErrorKind::WriteZero {
                    io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("shard outgrew its {estimate}-byte mapped region"),
                    )
                } else {
                    e
                }
            })?;
            let written = cursor.position();
            map.flush()?;
            written
        };

        // the mapped region is an upper bound; drop the unused tail
        file.set_len(written)?;
        Ok(written)
    }
}

/// The writer strategy for `mode`.
#[must_use]
pub fn writer_for(mode: WriteMode, config: &PipelineConfig) -> Box<dyn ShardWriter> {
    match mode {
        #[cfg(feature = "mmap")]
        WriteMode::Mapped => Box::new(MappedWriter),
        #[cfg(not(feature = "mmap"))]
        WriteMode::Mapped => Box::new(StreamedWriter {
            buffer_size: config.stream_buffer,
        }),
        WriteMode::Streamed => Box::new(StreamedWriter {
            buffer_size: config.stream_buffer,
        }),
    }
}

/// Removes the shard file on drop unless [`PartialShard::keep`] was called.
struct PartialShard<'a> {
    path: &'a Path,
    armed: bool,
}

impl<'a> PartialShard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialShard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(self.path);
        }
    }
}

/// The shard document, generating records lazily in sub-batches of `batch`.
struct ShardDocument<'a, S> {
    ids: &'a [i64],
    secrets: RefCell<S>,
    batch: usize,
}

struct Items<'d, 'a, S>(&'d ShardDocument<'a, S>);

impl<S: SecretSource> Serialize for ShardDocument<'_, S> {
    fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        let mut doc = serializer.serialize_struct("Shard", 1)?;
        doc.serialize_field("items", &Items(self))?;
        doc.end()
    }
}

impl<S: SecretSource> Serialize for Items<'_, '_, S> {
    fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        let doc = self.0;
        let mut secrets = doc.secrets.borrow_mut();
        let mut seq = serializer.serialize_seq(Some(doc.ids.len()))?;
        let mut records = Vec::with_capacity(doc.batch.min(doc.ids.len()));
        for ids in doc.ids.chunks(doc.batch.max(1)) {
            records.clear();
            records.extend(ids.iter().map(|&id| Record {
                id,
                secret: secrets.next_secret(),
            }));
            for record in &records {
                seq.serialize_element(record)?;
            }
        }
        seq.end()
    }
}

/// Serialize `chunk` as shard `index` into `config.output_dir`.
///
/// The write strategy follows [`WriteMode::select`] over
/// `config.estimate.for_count(chunk.len())` and `config.mapping_cap`.
///
/// # Errors
/// Returns [`ShardError::OutputDir`] if the output directory cannot be created and
/// [`ShardError::Serialization`] if writing fails; in the latter case the shard
/// file no longer exists when the error is returned.
pub fn write_shard<S: SecretSource>(
    chunk: &Chunk,
    index: usize,
    config: &PipelineConfig,
    secrets: S,
) -> Result<ShardFile> {
    let estimate = config.estimate.for_count(chunk.len());
    let writer = writer_for(WriteMode::select(estimate, config.mapping_cap), config);
    write_shard_with(chunk, index, config, secrets, writer.as_ref())
}

/// [`write_shard`] with an explicit writer strategy.
///
/// # Errors
/// Same as [`write_shard`].
pub fn write_shard_with<S: SecretSource>(
    chunk: &Chunk,
    index: usize,
    config: &PipelineConfig,
    secrets: S,
    writer: &dyn ShardWriter,
) -> Result<ShardFile> {
    ensure_output_dir(&config.output_dir)?;
    let path = shard_path(&config.output_dir, index);
    let estimate = config.estimate.for_count(chunk.len());
    let mode = writer.mode();
    debug!(
        shard = index,
        items = chunk.len(),
        estimate,
        ?mode,
        "serializing shard"
    );

    let doc = ShardDocument {
        ids: chunk.values(),
        secrets: RefCell::new(secrets),
        batch: config.write_batch,
    };

    let guard = PartialShard::new(&path);
    let bytes = writer
        .write(&path, estimate, &mut |w: &mut dyn Write| {
            serde_json::to_writer_pretty(&mut *w, &doc).map_err(io::Error::from)
        })
        .map_err(|source| ShardError::Serialization {
            path: path.clone(),
            source,
        })?;
    guard.keep();

    info!(shard = index, path = %path.display(), bytes, ?mode, "shard written");
    Ok(ShardFile {
        index,
        path,
        items: chunk.len(),
        bytes,
        mode,
    })
}
