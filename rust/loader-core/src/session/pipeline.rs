// rust/loader-core/src/session/pipeline.rs

//! Per-session batch pipeline: shuffle draws followed by assembly.

use std::fmt;
use std::mem;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::assembler::{Batch, BatchAssembler, ReadSlots};
use crate::catalog::Snapshot;
use crate::error::{ErrorContext, LoaderError, Result};
use crate::shuffle::ShuffleEngine;

/// How a session treats the end of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochPolicy {
    /// Serve this many epochs, each ending in a short batch flagged
    /// `is_epoch_end`.
    Bounded(u32),
    /// Roll into the next epoch mid-batch and never stop.
    Continuous,
}

impl fmt::Display for EpochPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded(n) => write!(f, "bounded({n})"),
            Self::Continuous => write!(f, "continuous"),
        }
    }
}

/// Position to fast-forward a new session to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumePosition {
    pub epoch_index: u32,
    pub cursor: u64,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub seed: u64,
    pub batch_size: u32,
    pub epoch_policy: EpochPolicy,
    pub buffer_capacity: u32,
    pub resume: Option<ResumePosition>,
}

/// A client's read context over one snapshot.
///
/// Only one batch runs at a time; the session store enforces that before
/// handing out `&mut Session`.
#[derive(Debug)]
pub struct Session {
    id: String,
    options: SessionOptions,
    engine: ShuffleEngine,
    // The last committed batch ran the current epoch dry
    epoch_done: bool,
    // Sized by the first assembler this session reads through
    read_slots: Option<ReadSlots>,
    batches_served: u64,
    samples_served: u64,
    created_at: DateTime<Utc>,
}

impl Session {
    /// # Errors
    ///
    /// `InvalidArgument` for a zero batch size, zero capacity, `Bounded(0)`
    /// or a resume position outside the snapshot; `EmptySnapshot` for a
    /// continuous session over a snapshot without samples.
    pub fn open(id: impl Into<String>, snapshot: Arc<Snapshot>, options: SessionOptions) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(LoaderError::invalid_argument("batch_size must be at least 1"));
        }
        match options.epoch_policy {
            EpochPolicy::Bounded(0) => {
                return Err(LoaderError::invalid_argument(
                    "bounded epoch policy needs at least one epoch",
                ))
            }
            EpochPolicy::Continuous if snapshot.is_empty() => {
                return Err(LoaderError::EmptySnapshot {
                    snapshot_id: snapshot.id().to_string(),
                })
            }
            _ => {}
        }

        let resume = options.resume.unwrap_or_default();
        if let EpochPolicy::Bounded(epochs) = options.epoch_policy {
            if resume.epoch_index >= epochs {
                return Err(LoaderError::invalid_argument(format!(
                    "resume epoch {} is outside bounded({epochs})",
                    resume.epoch_index
                )));
            }
        }

        let engine = ShuffleEngine::restore(
            snapshot,
            options.seed,
            resume.epoch_index,
            options.buffer_capacity,
            resume.cursor,
        )?;

        Ok(Self {
            id: id.into(),
            options,
            engine,
            epoch_done: false,
            read_slots: None,
            batches_served: 0,
            samples_served: 0,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        self.engine.snapshot()
    }

    pub fn epoch_index(&self) -> u32 {
        self.engine.epoch_index()
    }

    /// Draws committed in the current epoch.
    pub fn cursor(&self) -> u64 {
        self.engine.draws()
    }

    pub fn batches_served(&self) -> u64 {
        self.batches_served
    }

    pub fn samples_served(&self) -> u64 {
        self.samples_served
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True once a bounded session has served its final epoch.
    pub fn is_finished(&self) -> bool {
        self.epoch_done && self.is_last_epoch()
    }

    pub fn context(&self) -> ErrorContext {
        ErrorContext {
            session_id: self.id.clone(),
            epoch_index: self.engine.epoch_index(),
            cursor: self.engine.draws(),
        }
    }

    fn is_last_epoch(&self) -> bool {
        match self.options.epoch_policy {
            EpochPolicy::Bounded(epochs) => self.engine.epoch_index().saturating_add(1) >= epochs,
            EpochPolicy::Continuous => false,
        }
    }

    /// Draws and resolves the next batch.
    ///
    /// On failure the session is left exactly where it was, so retrying
    /// yields the same samples.
    pub async fn next_batch(&mut self, assembler: &BatchAssembler) -> Result<Batch> {
        let context = self.context();

        if self.is_finished() {
            return Ok(Batch {
                epoch_index: self.engine.epoch_index(),
                is_epoch_end: true,
                cursor: self.engine.draws(),
                ..Default::default()
            });
        }

        // Engine state before this batch, if the batch replaces the engine
        let mut retired: Option<ShuffleEngine> = None;
        let was_done = self.epoch_done;
        if self.epoch_done {
            let next = self.engine.next_epoch();
            retired = Some(mem::replace(&mut self.engine, next));
            self.epoch_done = false;
        }

        let batch_size = self.options.batch_size as usize;
        let mut refs = Vec::with_capacity(batch_size);
        let mut first_epoch = None;
        let mut epoch_boundary = None;
        let mut epoch_end = false;

        self.engine.begin();
        while refs.len() < batch_size {
            if let Some(sample) = self.engine.draw() {
                first_epoch.get_or_insert(self.engine.epoch_index());
                refs.push(sample);
                continue;
            }

            match self.options.epoch_policy {
                EpochPolicy::Bounded(_) => {
                    epoch_end = true;
                    break;
                }
                EpochPolicy::Continuous => {
                    if !refs.is_empty() {
                        epoch_boundary.get_or_insert(refs.len() as u32);
                    }
                    let next = self.engine.next_epoch();
                    let finished = mem::replace(&mut self.engine, next);
                    retired.get_or_insert(finished);
                    self.engine.begin();
                }
            }
        }

        let slots = self
            .read_slots
            .get_or_insert_with(|| assembler.read_slots())
            .clone();
        match assembler
            .resolve(self.engine.snapshot(), &refs, &context, &slots)
            .await
        {
            Ok(samples) => {
                self.engine.commit();
                self.epoch_done = epoch_end;
                self.batches_served += 1;
                self.samples_served += samples.len() as u64;

                if self.engine.epoch_index() != context.epoch_index {
                    tracing::info!(
                        "Session {} entered epoch {}",
                        self.id,
                        self.engine.epoch_index()
                    );
                }
                if self.is_finished() {
                    tracing::info!(
                        "Session {} finished its final epoch {}",
                        self.id,
                        self.engine.epoch_index()
                    );
                }

                Ok(Batch {
                    samples,
                    refs,
                    epoch_index: first_epoch.unwrap_or_else(|| self.engine.epoch_index()),
                    is_epoch_end: epoch_end,
                    cursor: self.engine.draws(),
                    epoch_boundary,
                })
            }
            Err(e) => {
                match retired {
                    Some(mut previous) => {
                        previous.rollback();
                        self.engine = previous;
                    }
                    None => self.engine.rollback(),
                }
                self.epoch_done = was_done;

                tracing::warn!(
                    "Batch failed for session {} at epoch {} cursor {}: {}",
                    self.id,
                    context.epoch_index,
                    context.cursor,
                    e
                );
                Err(e)
            }
        }
    }
}
