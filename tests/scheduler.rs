use anyhow::Result;
use shardpack::config::worker_count_for;
use shardpack::io::xz::xz_path;
use shardpack::scheduler::{PendingShard, plan_batches};
use shardpack::{CompressionScheduler, ShardCompressor, ShardError, ShutdownSignal, XzCompressor};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Records when each shard's task started and finished; fails on request.
#[derive(Default)]
struct RecordingCompressor {
    spans: Mutex<HashMap<PathBuf, (Instant, Instant)>>,
    started: Mutex<Vec<PathBuf>>,
    fail_on: Option<String>,
    panic_on: Option<String>,
    work: Duration,
}

impl RecordingCompressor {
    fn with_work(work: Duration) -> Self {
        Self {
            work,
            ..Self::default()
        }
    }

    fn span(&self, path: &Path) -> Option<(Instant, Instant)> {
        self.spans.lock().unwrap().get(path).copied()
    }

    fn started(&self) -> Vec<PathBuf> {
        self.started.lock().unwrap().clone()
    }
}

fn name_of(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}

impl ShardCompressor for RecordingCompressor {
    fn compress(&self, shard: &Path, _signal: &ShutdownSignal) -> io::Result<PathBuf> {
        let start = Instant::now();
        self.started.lock().unwrap().push(shard.to_path_buf());
        let artifact = xz_path(shard);
        fs::write(&artifact, b"partial")?;
        thread::sleep(self.work);

        let name = name_of(shard);
        let outcome = if self.panic_on.as_deref() == Some(name.as_str()) {
            panic!("boom on {name}");
        } else if self.fail_on.as_deref() == Some(name.as_str()) {
            Err(io::Error::other(format!("injected failure on {name}")))
        } else {
            fs::remove_file(shard)?;
            Ok(artifact)
        };
        self.spans
            .lock()
            .unwrap()
            .insert(shard.to_path_buf(), (start, Instant::now()));
        outcome
    }
}

/// Shard files named by their size, in emission order.
fn shards_with_sizes(dir: &Path, sizes: &[usize]) -> Result<Vec<PathBuf>> {
    sizes
        .iter()
        .map(|&size| {
            let path = dir.join(format!("size{size}.json"));
            fs::write(&path, vec![b'x'; size])?;
            Ok(path)
        })
        .collect()
}

fn pending(sizes: &[u64]) -> Vec<PendingShard> {
    sizes
        .iter()
        .enumerate()
        .map(|(position, &bytes)| PendingShard {
            path: PathBuf::from(format!("s{position}")),
            bytes,
            position,
        })
        .collect()
}

fn batch_sizes(batches: &[Vec<PendingShard>]) -> Vec<Vec<u64>> {
    batches
        .iter()
        .map(|b| b.iter().map(|s| s.bytes).collect())
        .collect()
}

#[test]
fn worker_count_keeps_a_margin_but_never_drops_to_zero() {
    assert_eq!(worker_count_for(8, 3), 5);
    assert_eq!(worker_count_for(4, 3), 1);
    assert_eq!(worker_count_for(2, 3), 1);
    assert_eq!(worker_count_for(16, 0), 16);
}

#[test]
fn batches_are_largest_first_and_worker_sized() {
    let batches = plan_batches(pending(&[10, 50, 20, 5, 30]), 2);
    assert_eq!(batch_sizes(&batches), vec![vec![50, 30], vec![20, 10], vec![5]]);
}

#[test]
fn equal_sizes_keep_emission_order() {
    let batches = plan_batches(pending(&[7, 7, 9, 7]), 3);
    let positions: Vec<Vec<usize>> = batches
        .iter()
        .map(|b| b.iter().map(|s| s.position).collect())
        .collect();
    assert_eq!(positions, vec![vec![2, 0, 1], vec![3]]);
}

#[test]
fn no_shards_no_batches() {
    assert!(plan_batches(Vec::new(), 4).is_empty());
}

#[test]
fn zero_workers_is_rejected() {
    let compressor = Arc::new(RecordingCompressor::default());
    let result = CompressionScheduler::new(0, compressor, ShutdownSignal::default());
    assert!(matches!(result, Err(ShardError::Config(_))));
}

#[test]
fn batches_are_joined_before_the_next_starts() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let paths = shards_with_sizes(tmp.path(), &[10, 50, 20, 5, 30])?;
    let compressor = Arc::new(RecordingCompressor::with_work(Duration::from_millis(40)));
    let scheduler = CompressionScheduler::new(2, compressor.clone(), ShutdownSignal::default())?;

    let report = scheduler.compress_all(&paths)?;
    assert_eq!(report.batches, 3);
    assert_eq!(report.worker_count, 2);

    let batch_of: HashMap<String, usize> = report
        .shards
        .iter()
        .map(|s| (name_of(&s.shard), s.batch))
        .collect();
    assert_eq!(batch_of["size50.json"], 1);
    assert_eq!(batch_of["size30.json"], 1);
    assert_eq!(batch_of["size20.json"], 2);
    assert_eq!(batch_of["size10.json"], 2);
    assert_eq!(batch_of["size5.json"], 3);

    let span = |size: usize| {
        compressor
            .span(&tmp.path().join(format!("size{size}.json")))
            .expect("every shard ran")
    };
    let batches = [vec![50, 30], vec![20, 10], vec![5]];
    for pair in batches.windows(2) {
        let last_end = pair[0].iter().map(|&s| span(s).1).max().unwrap();
        let first_start = pair[1].iter().map(|&s| span(s).0).min().unwrap();
        assert!(
            last_end <= first_start,
            "batch {:?} started before batch {:?} finished",
            pair[1],
            pair[0]
        );
    }

    for path in &paths {
        assert!(!path.exists());
        assert!(xz_path(path).exists());
    }
    Ok(())
}

#[test]
fn batch_tasks_run_concurrently() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let paths = shards_with_sizes(tmp.path(), &[100, 200])?;
    let compressor = Arc::new(RecordingCompressor::with_work(Duration::from_millis(200)));
    let scheduler = CompressionScheduler::new(2, compressor.clone(), ShutdownSignal::default())?;
    scheduler.compress_all(&paths)?;

    let (a_start, a_end) = compressor.span(&paths[0]).unwrap();
    let (b_start, b_end) = compressor.span(&paths[1]).unwrap();
    assert!(a_start < b_end && b_start < a_end, "tasks of one batch did not overlap");
    Ok(())
}

#[test]
fn failing_task_stops_later_batches_but_not_its_sibling() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let paths = shards_with_sizes(tmp.path(), &[10, 50, 20, 5, 30])?;
    let compressor = Arc::new(RecordingCompressor {
        fail_on: Some("size50.json".into()),
        work: Duration::from_millis(20),
        ..RecordingCompressor::default()
    });
    let scheduler = CompressionScheduler::new(2, compressor.clone(), ShutdownSignal::default())?;

    let err = scheduler
        .compress_all(&paths)
        .expect_err("one task was set up to fail");
    let failed = tmp.path().join("size50.json");
    assert!(matches!(&err, ShardError::Compression { path, .. } if *path == failed));
    assert!(!err.is_interrupted());

    // the sibling in batch 1 finished and was compressed
    let sibling = tmp.path().join("size30.json");
    assert!(compressor.span(&sibling).is_some());
    assert!(!sibling.exists());
    assert!(xz_path(&sibling).exists());

    // the failed shard is intact and its partial artifact is gone
    assert!(failed.exists());
    assert!(!xz_path(&failed).exists());

    // nothing from batch 2 or 3 started
    let started: Vec<String> = compressor.started().iter().map(|p| name_of(p)).collect();
    assert_eq!(started.len(), 2, "started: {started:?}");
    for name in ["size20.json", "size10.json", "size5.json"] {
        assert!(!started.iter().any(|s| s == name));
        assert!(tmp.path().join(name).exists());
    }
    Ok(())
}

#[test]
fn panicking_task_is_reported_as_compression_failure() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let paths = shards_with_sizes(tmp.path(), &[1, 2, 3])?;
    let compressor = Arc::new(RecordingCompressor {
        panic_on: Some("size2.json".into()),
        ..RecordingCompressor::default()
    });
    let scheduler = CompressionScheduler::new(3, compressor, ShutdownSignal::default())?;

    match scheduler.compress_all(&paths) {
        Err(ShardError::Compression { path, source }) => {
            assert_eq!(path, tmp.path().join("size2.json"));
            assert!(source.to_string().contains("boom on size2.json"));
        }
        other => panic!("expected compression failure, got {other:?}"),
    }
    assert!(!xz_path(&tmp.path().join("size2.json")).exists());
    Ok(())
}

#[test]
fn requested_shutdown_prevents_any_batch() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let paths = shards_with_sizes(tmp.path(), &[1, 2])?;
    let compressor = Arc::new(RecordingCompressor::default());
    let signal = ShutdownSignal::default();
    let scheduler = CompressionScheduler::new(1, compressor.clone(), signal.clone())?;

    signal.request();
    let err = scheduler.compress_all(&paths).expect_err("shutdown was requested");
    assert!(err.is_interrupted());
    assert!(compressor.started().is_empty());
    Ok(())
}

#[test]
fn missing_shard_is_reported_before_any_work() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut paths = shards_with_sizes(tmp.path(), &[1])?;
    paths.push(tmp.path().join("gone.json"));
    let compressor = Arc::new(RecordingCompressor::default());
    let scheduler = CompressionScheduler::new(1, compressor.clone(), ShutdownSignal::default())?;

    let err = scheduler.compress_all(&paths).expect_err("one shard is missing");
    assert_eq!(err.shard_path(), Some(tmp.path().join("gone.json").as_path()));
    assert!(compressor.started().is_empty());
    Ok(())
}

#[test]
fn empty_input_is_a_no_op() -> Result<()> {
    let scheduler = CompressionScheduler::new(
        2,
        Arc::new(RecordingCompressor::default()),
        ShutdownSignal::default(),
    )?;
    let report = scheduler.compress_all(&[])?;
    assert_eq!(report.batches, 0);
    assert!(report.shards.is_empty());
    Ok(())
}

#[test]
fn shutdown_releases_the_pool() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let paths = shards_with_sizes(tmp.path(), &[1])?;
    let mut scheduler = CompressionScheduler::new(
        1,
        Arc::new(RecordingCompressor::default()),
        ShutdownSignal::default(),
    )?;
    scheduler.shutdown();
    scheduler.shutdown();
    let err = scheduler.compress_all(&paths).expect_err("pool is gone");
    assert!(err.is_interrupted());
    Ok(())
}

#[test]
fn shutdown_during_a_batch_lets_it_finish_and_stops_the_rest() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let paths = shards_with_sizes(tmp.path(), &[40, 30, 20, 10])?;
    let compressor = Arc::new(RecordingCompressor::with_work(Duration::from_millis(300)));
    let signal = ShutdownSignal::default();
    let scheduler = CompressionScheduler::new(2, compressor.clone(), signal.clone())?;

    let requester = {
        let signal = signal.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            signal.request();
        })
    };
    let err = scheduler
        .compress_all(&paths)
        .expect_err("shutdown arrives while batch 1 runs");
    requester.join().expect("requester thread");
    assert!(err.is_interrupted());

    // batch 1 ran to completion
    for name in ["size40.json", "size30.json"] {
        let path = tmp.path().join(name);
        assert!(compressor.span(&path).is_some(), "{name} did not finish");
        assert!(!path.exists());
        assert!(xz_path(&path).exists());
    }
    // batch 2 never started
    assert_eq!(compressor.started().len(), 2);
    for name in ["size20.json", "size10.json"] {
        let path = tmp.path().join(name);
        assert!(path.exists());
        assert!(!xz_path(&path).exists());
    }
    Ok(())
}

/// Requests shutdown as its task starts, then compresses for real.
struct InterruptingCompressor(XzCompressor);

impl ShardCompressor for InterruptingCompressor {
    fn compress(&self, shard: &Path, signal: &ShutdownSignal) -> io::Result<PathBuf> {
        signal.request();
        self.0.compress(shard, signal)
    }
}

#[test]
fn force_cancelled_task_keeps_its_shard_and_leaves_no_artifact() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let paths = shards_with_sizes(tmp.path(), &[4096])?;
    let signal = ShutdownSignal::new(Duration::ZERO);
    let scheduler = CompressionScheduler::new(
        1,
        Arc::new(InterruptingCompressor(XzCompressor::default())),
        signal.clone(),
    )?;

    let err = scheduler
        .compress_all(&paths)
        .expect_err("grace period is zero");
    assert!(err.is_interrupted());
    assert!(signal.is_force_cancelled());
    assert_eq!(err.shard_path(), Some(paths[0].as_path()));
    assert_eq!(fs::metadata(&paths[0])?.len(), 4096);
    assert!(!xz_path(&paths[0]).exists());
    Ok(())
}

/// Reports success without producing the artifact.
struct VanishingCompressor;

impl ShardCompressor for VanishingCompressor {
    fn compress(&self, shard: &Path, _signal: &ShutdownSignal) -> io::Result<PathBuf> {
        Ok(xz_path(shard))
    }
}

#[test]
fn unreadable_artifact_size_is_reported_as_zero() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let paths = shards_with_sizes(tmp.path(), &[8])?;
    let scheduler =
        CompressionScheduler::new(1, Arc::new(VanishingCompressor), ShutdownSignal::default())?;

    let report = scheduler.compress_all(&paths)?;
    assert_eq!(report.shards.len(), 1);
    assert_eq!(report.shards[0].original_bytes, 8);
    assert_eq!(report.shards[0].compressed_bytes, 0);
    Ok(())
}
