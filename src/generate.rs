//! Input file generation for local runs.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

const FLUSH_EVERY: u64 = 1_000_000;
const REPORT_EVERY: u64 = 5_000_000;

/// Write `1..=total`, one value per line, to `path`.
///
/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn generate_number_file(path: impl AsRef<Path>, total: u64) -> Result<()> {
    let path = path.as_ref();
    let started = Instant::now();
    info!(path = %path.display(), total, "generating input file");

    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for i in 1..=total {
        writeln!(w, "{i}").with_context(|| format!("write {}", path.display()))?;
        if i % FLUSH_EVERY == 0 {
            w.flush()?;
        }
        if i % REPORT_EVERY == 0 || i == total {
            debug!(written = i, total, "generation progress");
        }
    }
    w.flush()?;

    let bytes = std::fs::metadata(path)?.len();
    info!(
        path = %path.display(),
        bytes,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "input file generated"
    );
    Ok(())
}

/// True when `path` exists and holds exactly `expected_lines` lines.
#[must_use]
pub fn is_number_file_complete(path: impl AsRef<Path>, expected_lines: u64) -> bool {
    let Ok(file) = File::open(path.as_ref()) else {
        return false;
    };
    let mut lines = 0u64;
    for line in BufReader::new(file).lines() {
        if line.is_err() {
            return false;
        }
        lines += 1;
    }
    lines == expected_lines
}
