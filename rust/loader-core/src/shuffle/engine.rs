// rust/loader-core/src/shuffle/engine.rs

use std::hash::Hasher;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use twox_hash::XxHash64;

use crate::catalog::{SampleRef, Snapshot, SourceCursor};
use crate::error::{LoaderError, Result};

/// Seed of the random stream for one epoch of a session.
///
/// XXH64 over the little-endian epoch index, keyed by the session seed.
pub fn epoch_seed(seed: u64, epoch_index: u32) -> u64 {
    let mut hasher = XxHash64::with_seed(seed);
    hasher.write(&u64::from(epoch_index).to_le_bytes());
    hasher.finish()
}

#[derive(Debug, Clone, Copy)]
enum Undo {
    // Slot was refilled from the source; holds the emitted ref
    Refilled { slot: usize, emitted: SampleRef },
    // Slot was swap-removed; holds the emitted ref
    Removed { slot: usize, emitted: SampleRef },
}

#[derive(Debug, Clone)]
struct Journal {
    rng: ChaCha8Rng,
    source: SourceCursor,
    draws: u64,
    ops: Vec<Undo>,
}

/// One epoch of the windowed shuffle over a snapshot.
#[derive(Debug)]
pub struct ShuffleEngine {
    snapshot: Arc<Snapshot>,
    seed: u64,
    epoch_index: u32,
    capacity: usize,
    buffer: Vec<SampleRef>,
    source: SourceCursor,
    rng: ChaCha8Rng,
    draws: u64,
    journal: Option<Journal>,
}

impl ShuffleEngine {
    /// Starts epoch `epoch_index` with a full buffer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when `capacity` is zero.
    pub fn new(snapshot: Arc<Snapshot>, seed: u64, epoch_index: u32, capacity: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(LoaderError::invalid_argument(
                "shuffle buffer capacity must be at least 1",
            ));
        }

        let capacity = capacity as usize;
        let fill = capacity.min(usize::try_from(snapshot.total_samples()).unwrap_or(usize::MAX));
        let mut buffer = Vec::with_capacity(fill);
        let mut source = SourceCursor::default();
        while buffer.len() < capacity {
            match source.next(&snapshot) {
                Some(sample) => buffer.push(sample),
                None => break,
            }
        }

        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(epoch_seed(seed, epoch_index)),
            snapshot,
            seed,
            epoch_index,
            capacity,
            buffer,
            source,
            draws: 0,
            journal: None,
        })
    }

    /// Rebuilds the engine as it was after `draws` draws of the epoch.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when `draws` exceeds the snapshot size.
    pub fn restore(
        snapshot: Arc<Snapshot>,
        seed: u64,
        epoch_index: u32,
        capacity: u32,
        draws: u64,
    ) -> Result<Self> {
        if draws > snapshot.total_samples() {
            return Err(LoaderError::invalid_argument(format!(
                "cursor {draws} is past the end of snapshot {} ({} samples)",
                snapshot.id(),
                snapshot.total_samples()
            )));
        }

        let mut engine = Self::new(snapshot, seed, epoch_index, capacity)?;
        for _ in 0..draws {
            engine.draw();
        }
        Ok(engine)
    }

    /// Same snapshot, seed and capacity, one epoch later.
    pub fn next_epoch(&self) -> Self {
        let mut source = SourceCursor::default();
        let mut buffer = Vec::with_capacity(self.buffer.capacity());
        while buffer.len() < self.capacity {
            match source.next(&self.snapshot) {
                Some(sample) => buffer.push(sample),
                None => break,
            }
        }
        let epoch_index = self.epoch_index.wrapping_add(1);

        Self {
            snapshot: Arc::clone(&self.snapshot),
            seed: self.seed,
            epoch_index,
            capacity: self.capacity,
            buffer,
            source,
            rng: ChaCha8Rng::seed_from_u64(epoch_seed(self.seed, epoch_index)),
            draws: 0,
            journal: None,
        }
    }

    /// Emits the next ref of the epoch, or `None` once it is complete.
    pub fn draw(&mut self) -> Option<SampleRef> {
        if self.buffer.is_empty() {
            return None;
        }

        let slot = self.rng.gen_range(0..self.buffer.len() as u64) as usize;
        let emitted = self.buffer[slot];

        let undo = match self.source.next(&self.snapshot) {
            Some(next) => {
                self.buffer[slot] = next;
                Undo::Refilled { slot, emitted }
            }
            None => {
                self.buffer.swap_remove(slot);
                Undo::Removed { slot, emitted }
            }
        };
        if let Some(journal) = self.journal.as_mut() {
            journal.ops.push(undo);
        }

        self.draws += 1;
        Some(emitted)
    }

    /// Starts recording draws so they can be undone with [`rollback`].
    ///
    /// A transaction already in progress is kept.
    ///
    /// [`rollback`]: ShuffleEngine::rollback
    pub fn begin(&mut self) {
        if self.journal.is_none() {
            self.journal = Some(Journal {
                rng: self.rng.clone(),
                source: self.source,
                draws: self.draws,
                ops: Vec::new(),
            });
        }
    }

    /// Keeps every draw made since [`begin`](ShuffleEngine::begin).
    pub fn commit(&mut self) {
        self.journal = None;
    }

    /// Undoes every draw made since [`begin`](ShuffleEngine::begin).
    pub fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };

        for undo in journal.ops.into_iter().rev() {
            match undo {
                Undo::Refilled { slot, emitted } => self.buffer[slot] = emitted,
                Undo::Removed { slot, emitted } => {
                    self.buffer.push(emitted);
                    let last = self.buffer.len() - 1;
                    self.buffer.swap(slot, last);
                }
            }
        }
        self.rng = journal.rng;
        self.source = journal.source;
        self.draws = journal.draws;
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn epoch_index(&self) -> u32 {
        self.epoch_index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Draws made so far in this epoch.
    pub fn draws(&self) -> u64 {
        self.draws
    }

    /// Refs currently held in the buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Draws left before the epoch ends.
    pub fn remaining(&self) -> u64 {
        self.snapshot.total_samples() - self.draws
    }

    pub fn is_exhausted(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::in_memory_snapshot;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn drain(engine: &mut ShuffleEngine) -> Vec<SampleRef> {
        std::iter::from_fn(|| engine.draw()).collect()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let snapshot = in_memory_snapshot("d", &[4]);
        let err = ShuffleEngine::new(snapshot, 1, 0, 0).unwrap_err();
        assert!(matches!(err, LoaderError::InvalidArgument { .. }));
    }

    #[test]
    fn test_epoch_seed_depends_on_both_inputs() {
        assert_eq!(epoch_seed(42, 0), epoch_seed(42, 0));
        assert_ne!(epoch_seed(42, 0), epoch_seed(42, 1));
        assert_ne!(epoch_seed(42, 0), epoch_seed(43, 0));
    }

    #[test]
    fn test_buffer_memory_is_bounded() {
        let snapshot = in_memory_snapshot("d", &[500, 500]);
        let mut engine = ShuffleEngine::new(snapshot, 7, 0, 16).unwrap();

        assert_eq!(engine.buffered(), 16);
        for _ in 0..1000 {
            assert!(engine.buffered() <= 16);
            engine.draw().unwrap();
        }
        assert!(engine.is_exhausted());
        assert_eq!(engine.draw(), None);
    }

    #[test]
    fn test_capacity_one_is_source_order() {
        let snapshot = in_memory_snapshot("d", &[3, 2]);
        let mut engine = ShuffleEngine::new(Arc::clone(&snapshot), 99, 0, 1).unwrap();
        assert_eq!(drain(&mut engine), snapshot.sample_refs().collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = in_memory_snapshot("d", &[]);
        let mut engine = ShuffleEngine::new(snapshot, 1, 0, 8).unwrap();
        assert!(engine.is_exhausted());
        assert_eq!(engine.draw(), None);
        assert_eq!(engine.remaining(), 0);
    }

    #[test]
    fn test_next_epoch_reshuffles() {
        let snapshot = in_memory_snapshot("d", &[64]);
        let mut first = ShuffleEngine::new(snapshot, 5, 0, 64).unwrap();
        let mut second = first.next_epoch();
        assert_eq!(second.epoch_index(), 1);

        let a = drain(&mut first);
        let b = drain(&mut second);
        assert_ne!(a, b);
        assert_eq!(
            a.iter().collect::<HashSet<_>>(),
            b.iter().collect::<HashSet<_>>()
        );
    }

    #[test]
    fn test_restore_past_end() {
        let snapshot = in_memory_snapshot("d", &[3]);
        assert!(ShuffleEngine::restore(snapshot, 1, 0, 2, 4).is_err());
    }

    #[test]
    fn test_rollback_without_begin_is_noop() {
        let snapshot = in_memory_snapshot("d", &[10]);
        let mut engine = ShuffleEngine::new(snapshot, 3, 0, 4).unwrap();
        engine.draw();
        engine.rollback();
        assert_eq!(engine.draws(), 1);
    }

    #[test]
    fn test_different_seeds_differ() {
        // With 40 samples and an 8-slot window a collision between two
        // independent seeds is vanishingly unlikely.
        let snapshot = in_memory_snapshot("d", &[40]);
        let mut seen = HashSet::new();
        for seed in 0..200u64 {
            let mut engine = ShuffleEngine::new(Arc::clone(&snapshot), seed, 0, 8).unwrap();
            assert!(seen.insert(drain(&mut engine)), "seed {seed} repeated an order");
        }
    }

    #[test]
    fn test_full_buffer_position_spread() {
        // With C >= N every sample should land in the first position
        // roughly equally often.
        let snapshot = in_memory_snapshot("d", &[4]);
        let mut counts = [0usize; 4];
        for seed in 0..4000u64 {
            let mut engine = ShuffleEngine::new(Arc::clone(&snapshot), seed, 0, 4).unwrap();
            let first = engine.draw().unwrap();
            counts[(first.offset / 4) as usize] += 1;
        }
        for count in counts {
            assert!((800..1200).contains(&count), "skewed counts {counts:?}");
        }
    }

    proptest! {
        #[test]
        fn prop_epoch_yields_each_sample_once(
            sizes in prop::collection::vec(0usize..40, 1..5),
            capacity in 1u32..64,
            seed in any::<u64>(),
        ) {
            let snapshot = in_memory_snapshot("d", &sizes);
            let n = snapshot.total_samples() as usize;
            let mut engine = ShuffleEngine::new(Arc::clone(&snapshot), seed, 0, capacity).unwrap();

            let drawn = drain(&mut engine);
            prop_assert_eq!(drawn.len(), n);
            let unique: HashSet<_> = drawn.iter().copied().collect();
            prop_assert_eq!(unique, snapshot.sample_refs().collect::<HashSet<_>>());
        }

        #[test]
        fn prop_same_seed_same_order(
            n in 1usize..120,
            capacity in 1u32..32,
            seed in any::<u64>(),
            epoch in 0u32..4,
        ) {
            let snapshot = in_memory_snapshot("d", &[n]);
            let mut a = ShuffleEngine::new(Arc::clone(&snapshot), seed, epoch, capacity).unwrap();
            let mut b = ShuffleEngine::new(snapshot, seed, epoch, capacity).unwrap();
            prop_assert_eq!(drain(&mut a), drain(&mut b));
        }

        #[test]
        fn prop_restore_matches_uninterrupted(
            n in 1usize..100,
            capacity in 1u32..32,
            seed in any::<u64>(),
            split in 0usize..100,
        ) {
            let split = split.min(n);
            let snapshot = in_memory_snapshot("d", &[n]);
            let mut full = ShuffleEngine::new(Arc::clone(&snapshot), seed, 2, capacity).unwrap();
            let order = drain(&mut full);

            let mut resumed =
                ShuffleEngine::restore(snapshot, seed, 2, capacity, split as u64).unwrap();
            prop_assert_eq!(resumed.draws(), split as u64);
            prop_assert_eq!(drain(&mut resumed), order[split..].to_vec());
        }

        #[test]
        fn prop_rollback_replays_same_draws(
            n in 1usize..80,
            capacity in 1u32..16,
            seed in any::<u64>(),
            before in 0usize..80,
            batch in 1usize..40,
        ) {
            let snapshot = in_memory_snapshot("d", &[n]);
            let mut engine = ShuffleEngine::new(snapshot, seed, 0, capacity).unwrap();
            for _ in 0..before.min(n) {
                engine.draw();
            }
            let draws_before = engine.draws();

            engine.begin();
            let first: Vec<_> = (0..batch).filter_map(|_| engine.draw()).collect();
            engine.rollback();
            prop_assert_eq!(engine.draws(), draws_before);

            engine.begin();
            let second: Vec<_> = (0..batch).filter_map(|_| engine.draw()).collect();
            engine.commit();
            prop_assert_eq!(first, second);
        }
    }
}
