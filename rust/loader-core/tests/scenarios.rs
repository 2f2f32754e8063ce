// rust/loader-core/tests/scenarios.rs

//! End-to-end flows across catalog, shuffle, assembler and session store.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tempfile::TempDir;

use loader_core::catalog::IndexEntry;
use loader_core::config::{DatasetConfig, SessionConfig, ShuffleConfig, StorageConfig};
use loader_core::{
    BatchAssembler, Catalog, EpochPolicy, LoaderError, OpenRequest, ResumePosition, SessionPhase,
    SessionStore, Shard, ShardReader, ShardWriter, Snapshot,
};

fn write_shard(path: &Path, samples: impl IntoIterator<Item = String>) {
    let mut writer = ShardWriter::create(path).unwrap();
    for sample in samples {
        writer.append(sample.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
}

fn store() -> SessionStore {
    SessionStore::new(SessionConfig::default(), ShuffleConfig::default())
}

fn assembler() -> BatchAssembler {
    BatchAssembler::with_limits(4, Duration::from_secs(5))
}

fn request(seed: u64, batch_size: u32, epoch_policy: EpochPolicy, capacity: u32) -> OpenRequest {
    OpenRequest {
        seed,
        batch_size,
        epoch_policy,
        buffer_capacity: Some(capacity),
        resume: None,
    }
}

fn text(samples: &[Bytes]) -> Vec<String> {
    samples
        .iter()
        .map(|b| String::from_utf8(b.to_vec()).unwrap())
        .collect()
}

/// Ten samples across two shard files on disk.
fn ten_sample_catalog() -> (TempDir, Catalog) {
    let dir = TempDir::new().unwrap();
    write_shard(
        &dir.path().join("00.shard"),
        (0..4).map(|i| format!("sample-{i}")),
    );
    write_shard(
        &dir.path().join("01.shard"),
        (4..10).map(|i| format!("sample-{i}")),
    );

    let catalog = Catalog::new(
        vec![DatasetConfig::new("tts", dir.path())],
        StorageConfig::default(),
    );
    catalog.scan_all().unwrap();
    (dir, catalog)
}

async fn drain_epoch(store: &SessionStore, session_id: &str) -> Vec<String> {
    let assembler = assembler();
    let mut out = Vec::new();
    loop {
        let batch = store.next_batch(session_id, &assembler).await.unwrap();
        out.extend(text(&batch.samples));
        if batch.is_epoch_end {
            return out;
        }
    }
}

#[tokio::test]
async fn ten_samples_capacity_three_seed_42() {
    let (_dir, catalog) = ten_sample_catalog();
    let store = store();
    let assembler = assembler();

    let snapshot = catalog.current("tts").unwrap();
    let slot = store
        .open(snapshot, request(42, 2, EpochPolicy::Bounded(1), 3))
        .await
        .unwrap();

    let mut drawn = Vec::new();
    for call in 0..5 {
        let batch = store.next_batch(slot.id(), &assembler).await.unwrap();
        assert_eq!(batch.len(), 2, "call {call}");
        assert!(!batch.is_epoch_end);
        assert_eq!(batch.cursor, 2 * (call + 1));
        drawn.extend(text(&batch.samples));
    }

    let sixth = store.next_batch(slot.id(), &assembler).await.unwrap();
    assert!(sixth.is_epoch_end);
    assert!(sixth.is_empty());

    let distinct: HashSet<_> = drawn.iter().cloned().collect();
    assert_eq!(distinct.len(), 10);

    // A second session with the same seed reproduces the exact sequence
    let again = store
        .open(
            catalog.current("tts").unwrap(),
            request(42, 2, EpochPolicy::Bounded(1), 3),
        )
        .await
        .unwrap();
    assert_eq!(drain_epoch(&store, again.id()).await, drawn);
}

#[tokio::test]
async fn different_seeds_give_different_orders() {
    let (_dir, catalog) = ten_sample_catalog();
    let store = store();

    let mut orders = HashSet::new();
    for seed in 0..20 {
        let slot = store
            .open(
                catalog.current("tts").unwrap(),
                request(seed, 4, EpochPolicy::Bounded(1), 10),
            )
            .await
            .unwrap();
        orders.insert(drain_epoch(&store, slot.id()).await);
    }
    // 10! orders; twenty seeds colliding at all would be remarkable
    assert!(orders.len() >= 19);
}

#[tokio::test]
async fn rescan_mid_epoch_keeps_session_view() {
    let (dir, catalog) = ten_sample_catalog();
    let store = store();
    let assembler = assembler();

    let slot = store
        .open(
            catalog.current("tts").unwrap(),
            request(7, 3, EpochPolicy::Bounded(1), 4),
        )
        .await
        .unwrap();
    let mut seen = text(&store.next_batch(slot.id(), &assembler).await.unwrap().samples);

    write_shard(
        &dir.path().join("02.shard"),
        (10..30).map(|i| format!("sample-{i}")),
    );
    let fresh = catalog.rescan("tts").unwrap();
    assert_eq!(fresh.total_samples(), 30);
    assert_eq!(catalog.live_snapshots("tts").unwrap(), 2);

    seen.extend(drain_epoch(&store, slot.id()).await);
    let expected: HashSet<_> = (0..10).map(|i| format!("sample-{i}")).collect();
    assert_eq!(seen.len(), 10);
    assert_eq!(seen.into_iter().collect::<HashSet<_>>(), expected);

    // Closing the last session on the old snapshot retires it
    assert!(store.close(slot.id()).await);
    drop(slot);
    assert_eq!(catalog.live_snapshots("tts").unwrap(), 1);
}

#[tokio::test]
async fn continuous_session_rolls_over() {
    let (_dir, catalog) = ten_sample_catalog();
    let store = store();
    let assembler = assembler();

    let slot = store
        .open(
            catalog.current("tts").unwrap(),
            request(3, 4, EpochPolicy::Continuous, 3),
        )
        .await
        .unwrap();

    let mut per_epoch: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for _ in 0..10 {
        let batch = store.next_batch(slot.id(), &assembler).await.unwrap();
        assert_eq!(batch.len(), 4);
        assert!(!batch.is_epoch_end);

        let samples = text(&batch.samples);
        let split = batch.epoch_boundary.map_or(samples.len(), |at| at as usize);
        let (head, tail) = samples.split_at(split);
        per_epoch
            .entry(batch.epoch_index)
            .or_default()
            .extend_from_slice(head);
        if !tail.is_empty() {
            per_epoch
                .entry(batch.epoch_index + 1)
                .or_default()
                .extend_from_slice(tail);
        }
    }

    // 40 samples = four complete epochs, each a permutation of the dataset
    assert_eq!(per_epoch.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    for epoch in per_epoch.values() {
        assert_eq!(epoch.len(), 10);
        assert_eq!(epoch.iter().collect::<HashSet<_>>().len(), 10);
    }
    assert_ne!(per_epoch[&0], per_epoch[&1]);
}

#[tokio::test]
async fn resume_from_reported_position() {
    let (_dir, catalog) = ten_sample_catalog();
    let store = store();
    let assembler = assembler();

    let original = store
        .open(
            catalog.current("tts").unwrap(),
            request(11, 3, EpochPolicy::Bounded(2), 4),
        )
        .await
        .unwrap();
    let mut last = None;
    for _ in 0..5 {
        last = Some(store.next_batch(original.id(), &assembler).await.unwrap());
    }
    let last = last.unwrap();
    let position = ResumePosition {
        epoch_index: last.epoch_index,
        cursor: last.cursor,
    };
    let expected = store.next_batch(original.id(), &assembler).await.unwrap();

    let mut resumed_request = request(11, 3, EpochPolicy::Bounded(2), 4);
    resumed_request.resume = Some(position);
    let resumed = store
        .open(catalog.current("tts").unwrap(), resumed_request)
        .await
        .unwrap();
    let actual = store.next_batch(resumed.id(), &assembler).await.unwrap();

    assert_eq!(actual.samples, expected.samples);
    assert_eq!(actual.epoch_index, expected.epoch_index);
}

/// In-memory shard whose reads can be made to fail or stall.
struct FaultyReader {
    data: Bytes,
    failing: AtomicBool,
    stall: Duration,
}

impl FaultyReader {
    fn new(samples: usize, stall: Duration) -> (Arc<Self>, Vec<IndexEntry>) {
        let mut data = Vec::new();
        let mut index = Vec::new();
        for i in 0..samples {
            let sample = format!("row-{i:03}");
            index.push(IndexEntry::new(data.len() as u64, sample.len() as u64));
            data.extend_from_slice(sample.as_bytes());
        }
        let reader = Arc::new(Self {
            data: Bytes::from(data),
            failing: AtomicBool::new(false),
            stall,
        });
        (reader, index)
    }
}

impl ShardReader for FaultyReader {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, length: u64) -> io::Result<Bytes> {
        std::thread::sleep(self.stall);
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "checksum mismatch"));
        }
        Ok(self
            .data
            .slice(offset as usize..(offset + length) as usize))
    }
}

fn faulty_snapshot(samples: usize, stall: Duration) -> (Arc<FaultyReader>, Arc<Snapshot>) {
    let (reader, index) = FaultyReader::new(samples, stall);
    let shard = Shard::from_reader(0, "mem://faulty/0", Arc::clone(&reader) as Arc<dyn ShardReader>, index);
    (reader, Arc::new(Snapshot::new("faulty", 1, vec![shard])))
}

#[tokio::test]
async fn failed_batch_is_tagged_and_retry_yields_same_samples() {
    let (reader, snapshot) = faulty_snapshot(20, Duration::ZERO);
    let store = store();
    let assembler = assembler();

    let reference = store
        .open(Arc::clone(&snapshot), request(5, 4, EpochPolicy::Bounded(1), 6))
        .await
        .unwrap();
    let mut expected = Vec::new();
    for _ in 0..3 {
        expected.push(store.next_batch(reference.id(), &assembler).await.unwrap());
    }

    let slot = store
        .open(snapshot, request(5, 4, EpochPolicy::Bounded(1), 6))
        .await
        .unwrap();
    store.next_batch(slot.id(), &assembler).await.unwrap();

    reader.failing.store(true, Ordering::SeqCst);
    let err = store.next_batch(slot.id(), &assembler).await.unwrap_err();
    match &err {
        LoaderError::SampleRead { context, sample, .. } => {
            assert_eq!(context.session_id, slot.id());
            assert_eq!(context.cursor, 4);
            assert_eq!(*sample, expected[1].refs[0]);
        }
        other => panic!("expected SampleRead, got {other:?}"),
    }

    // Nothing was consumed by the failed attempt
    reader.failing.store(false, Ordering::SeqCst);
    let retried = store.next_batch(slot.id(), &assembler).await.unwrap();
    assert_eq!(retried.refs, expected[1].refs);
    assert_eq!(retried.cursor, 8);
    let third = store.next_batch(slot.id(), &assembler).await.unwrap();
    assert_eq!(third.refs, expected[2].refs);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_read_times_out_without_blocking_other_sessions() {
    let (_stalled_reader, stalled) = faulty_snapshot(8, Duration::from_secs(3));
    let (_dir, catalog) = ten_sample_catalog();
    let store = Arc::new(store());
    let assembler = Arc::new(BatchAssembler::with_limits(2, Duration::from_millis(200)));

    let stuck = store
        .open(stalled, request(1, 2, EpochPolicy::Continuous, 4))
        .await
        .unwrap();
    let healthy = store
        .open(
            catalog.current("tts").unwrap(),
            request(1, 2, EpochPolicy::Continuous, 4),
        )
        .await
        .unwrap();

    let started = Instant::now();
    let stuck_task = {
        let store = Arc::clone(&store);
        let assembler = Arc::clone(&assembler);
        let id = stuck.id().to_string();
        tokio::spawn(async move { store.next_batch(&id, &assembler).await })
    };
    for _ in 0..5 {
        store.next_batch(healthy.id(), &assembler).await.unwrap();
    }
    let healthy_elapsed = started.elapsed();

    let err = stuck_task.await.unwrap().unwrap_err();
    assert!(matches!(err, LoaderError::ReadTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(healthy_elapsed < Duration::from_secs(2));
    assert_eq!(stuck.context().cursor, 0);
}

#[test]
fn retries_against_a_stalled_shard_cannot_exhaust_the_blocking_pool() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .max_blocking_threads(4)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let (_stalled_reader, stalled) = faulty_snapshot(8, Duration::from_secs(3));
        let (_dir, catalog) = ten_sample_catalog();
        let store = store();
        let assembler = BatchAssembler::with_limits(2, Duration::from_millis(100));

        let stuck = store
            .open(stalled, request(1, 2, EpochPolicy::Continuous, 4))
            .await
            .unwrap();
        let first = store.next_batch(stuck.id(), &assembler).await.unwrap_err();
        assert!(matches!(first, LoaderError::ReadTimeout { .. }));

        // Each retry fails at once instead of pinning more pool threads
        for _ in 0..4 {
            let retry = store.next_batch(stuck.id(), &assembler).await.unwrap_err();
            assert!(matches!(retry, LoaderError::SampleRead { .. }));
            assert_eq!(retry.context().map(|c| c.cursor), Some(0));
        }

        let healthy = store
            .open(
                catalog.current("tts").unwrap(),
                request(1, 2, EpochPolicy::Bounded(1), 4),
            )
            .await
            .unwrap();
        let batch = store.next_batch(healthy.id(), &assembler).await.unwrap();
        assert_eq!(batch.len(), 2);
    });

    // The stalled reads are still asleep; don't wait for them
    runtime.shutdown_background();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_requests_fail_fast_and_close_lets_inflight_finish() {
    let (_reader, snapshot) = faulty_snapshot(8, Duration::from_millis(150));
    let store = Arc::new(store());
    let assembler = Arc::new(assembler());

    let slot = store
        .open(snapshot, request(9, 2, EpochPolicy::Bounded(1), 4))
        .await
        .unwrap();
    let id = slot.id().to_string();

    let first = {
        let store = Arc::clone(&store);
        let assembler = Arc::clone(&assembler);
        let id = id.clone();
        tokio::spawn(async move { store.next_batch(&id, &assembler).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = store.next_batch(&id, &assembler).await;
    assert!(matches!(second, Err(LoaderError::SessionBusy { .. })));

    // Closing does not wait for the in-flight batch
    assert!(store.close(&id).await);
    let batch = first.await.unwrap().unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.cursor, 2);

    // The closed session reports where the in-flight batch left it
    match store.next_batch(&id, &assembler).await {
        Err(LoaderError::SessionClosed { context }) => assert_eq!(context.cursor, 2),
        other => panic!("expected SessionClosed, got {other:?}"),
    }
    let info = store.describe(&id).await.unwrap();
    assert_eq!(info.phase, SessionPhase::Closed);
    assert_eq!(info.cursor, 2);
    assert_eq!(info.batches_served, 1);
}

#[tokio::test]
async fn corrupt_shard_fails_scan() {
    let dir = TempDir::new().unwrap();
    write_shard(&dir.path().join("00.shard"), ["ok".to_string()]);
    let path = dir.path().join("01.shard");
    write_shard(&path, ["a".to_string(), "b".to_string()]);

    // Truncate the footer
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

    let catalog = Catalog::new(
        vec![DatasetConfig::new("bad", dir.path())],
        StorageConfig::default(),
    );
    assert!(matches!(
        catalog.scan_all(),
        Err(LoaderError::CorruptIndex { .. })
    ));
}
