// rust/loader-core/src/shuffle/mod.rs

//! Shuffle Engine.
//!
//! Produces a near-uniform permutation of a snapshot's samples while
//! holding at most `C` sample refs in memory. The order is a pure function
//! of `(snapshot, seed, epoch_index)`; any position inside an epoch can be
//! rebuilt from the number of draws already made.
//!
//! ## Windowed shuffle
//!
//! 1. Fill the buffer with the first `C` refs in source order.
//! 2. On each draw pick an occupied slot uniformly at random and emit it.
//! 3. If the source still has refs, the next one takes the emitted slot;
//!    otherwise the slot is removed by swapping in the last entry.
//! 4. The epoch ends when the buffer is empty.
//!
//! With `C >= N` the buffer holds the whole snapshot and every draw is a
//! uniform choice among the remaining samples, which is an exact shuffle.

mod engine;

pub use engine::{epoch_seed, ShuffleEngine};
