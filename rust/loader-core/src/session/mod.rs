// rust/loader-core/src/session/mod.rs

//! Sessions: per-client shuffle state and the table that tracks them.
//!
//! A session is `{seed, epoch_index, cursor}` over one snapshot. Those
//! three values are enough to rebuild its exact shuffle position, which is
//! how a client resumes after reopening.

mod pipeline;
mod store;

pub use pipeline::{EpochPolicy, ResumePosition, Session, SessionOptions};
pub use store::{OpenRequest, SessionInfo, SessionPhase, SessionSlot, SessionStore};
