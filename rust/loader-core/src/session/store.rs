// rust/loader-core/src/session/store.rs

//! Session table with per-session locking and idle expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use super::pipeline::{EpochPolicy, ResumePosition, Session, SessionOptions};
use crate::assembler::{Batch, BatchAssembler};
use crate::catalog::Snapshot;
use crate::config::{SessionConfig, ShuffleConfig};
use crate::error::{ErrorContext, LoaderError, Result};

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Opened, no batch served yet.
    Created,
    /// A batch is being assembled right now.
    Active,
    /// Waiting for the next request, within the idle TTL.
    Idle,
    /// Idle past the TTL.
    Expired,
    /// Closed by the client.
    Closed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Expired => "expired",
            Self::Closed => "closed",
        }
    }
}

/// What a client asks for when opening a session.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub seed: u64,
    pub batch_size: u32,
    pub epoch_policy: EpochPolicy,
    /// Shuffle buffer capacity; the configured default when `None`.
    pub buffer_capacity: Option<u32>,
    pub resume: Option<ResumePosition>,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub dataset_id: String,
    pub snapshot_id: String,
    pub total_samples: u64,
    pub seed: u64,
    pub batch_size: u32,
    pub epoch_policy: EpochPolicy,
    pub buffer_capacity: u32,
    pub epoch_index: u32,
    pub cursor: u64,
    pub phase: SessionPhase,
    pub batches_served: u64,
    pub samples_served: u64,
    pub created_at: DateTime<Utc>,
    pub idle_for: Duration,
}

/// One entry of the session table.
///
/// The session itself sits behind its own mutex; the rest is readable
/// without waiting for an in-flight batch.
pub struct SessionSlot {
    id: String,
    session: Arc<Mutex<Session>>,
    snapshot: Arc<Snapshot>,
    options: SessionOptions,
    created_at: DateTime<Utc>,
    last_access: StdMutex<Instant>,
    served: AtomicBool,
    epoch_index: AtomicU32,
    cursor: AtomicU64,
    batches_served: AtomicU64,
    samples_served: AtomicU64,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            id: session.id().to_string(),
            snapshot: Arc::clone(session.snapshot()),
            options: session.options().clone(),
            created_at: session.created_at(),
            epoch_index: AtomicU32::new(session.epoch_index()),
            cursor: AtomicU64::new(session.cursor()),
            session: Arc::new(Mutex::new(session)),
            last_access: StdMutex::new(Instant::now()),
            served: AtomicBool::new(false),
            batches_served: AtomicU64::new(0),
            samples_served: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Last committed position.
    pub fn context(&self) -> ErrorContext {
        ErrorContext {
            session_id: self.id.clone(),
            epoch_index: self.epoch_index.load(Ordering::Acquire),
            cursor: self.cursor.load(Ordering::Acquire),
        }
    }

    fn touch(&self) {
        *self
            .last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn is_busy(&self) -> bool {
        self.session.try_lock().is_err()
    }

    fn phase(&self, idle_ttl: Duration) -> SessionPhase {
        if self.is_busy() {
            SessionPhase::Active
        } else if self.idle_for() > idle_ttl {
            SessionPhase::Expired
        } else if self.served.load(Ordering::Acquire) {
            SessionPhase::Idle
        } else {
            SessionPhase::Created
        }
    }

    fn record(&self, session: &Session) {
        self.epoch_index
            .store(session.epoch_index(), Ordering::Release);
        self.cursor.store(session.cursor(), Ordering::Release);
        self.batches_served
            .store(session.batches_served(), Ordering::Release);
        self.samples_served
            .store(session.samples_served(), Ordering::Release);
    }

    fn info(&self, idle_ttl: Duration) -> SessionInfo {
        let context = self.context();
        SessionInfo {
            session_id: self.id.clone(),
            dataset_id: self.snapshot.dataset_id().to_string(),
            snapshot_id: self.snapshot.id().to_string(),
            total_samples: self.snapshot.total_samples(),
            seed: self.options.seed,
            batch_size: self.options.batch_size,
            epoch_policy: self.options.epoch_policy,
            buffer_capacity: self.options.buffer_capacity,
            epoch_index: context.epoch_index,
            cursor: context.cursor,
            phase: self.phase(idle_ttl),
            batches_served: self.batches_served.load(Ordering::Acquire),
            samples_served: self.samples_served.load(Ordering::Acquire),
            created_at: self.created_at,
            idle_for: self.idle_for(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Closed,
    Expired,
}

impl EndReason {
    fn phase(self) -> SessionPhase {
        match self {
            Self::Closed => SessionPhase::Closed,
            Self::Expired => SessionPhase::Expired,
        }
    }
}

// Remembers how a session ended so later lookups can say so.
#[derive(Debug, Clone)]
struct Tombstone {
    reason: EndReason,
    info: SessionInfo,
    at: Instant,
}

impl Tombstone {
    fn new(slot: &SessionSlot, reason: EndReason) -> Self {
        Self {
            reason,
            info: Self::final_info(slot, reason),
            at: Instant::now(),
        }
    }

    fn final_info(slot: &SessionSlot, reason: EndReason) -> SessionInfo {
        let mut info = slot.info(Duration::MAX);
        info.phase = reason.phase();
        info
    }

    // Picks up the position of a batch that finished after the session ended
    fn refresh(&mut self, slot: &SessionSlot) {
        self.info = Self::final_info(slot, self.reason);
    }

    fn error(&self, session_id: &str) -> LoaderError {
        let context = ErrorContext {
            session_id: session_id.to_string(),
            epoch_index: self.info.epoch_index,
            cursor: self.info.cursor,
        };
        match self.reason {
            EndReason::Closed => LoaderError::SessionClosed { context },
            EndReason::Expired => LoaderError::SessionExpired { context },
        }
    }
}

/// Registry of open sessions.
///
/// The table lock is only held to look up, insert or remove a slot, never
/// while a batch is assembled, so sessions never wait on each other.
pub struct SessionStore {
    config: SessionConfig,
    shuffle: ShuffleConfig,
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
    tombstones: RwLock<HashMap<String, Tombstone>>,
}

impl SessionStore {
    pub fn new(config: SessionConfig, shuffle: ShuffleConfig) -> Self {
        Self {
            config,
            shuffle,
            sessions: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Opens a session bound to `snapshot`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for sizes outside the configured limits (or any
    /// error [`Session::open`] raises), `TooManySessions` when the table is
    /// full.
    pub async fn open(&self, snapshot: Arc<Snapshot>, request: OpenRequest) -> Result<Arc<SessionSlot>> {
        if request.batch_size > self.config.max_batch_size {
            return Err(LoaderError::invalid_argument(format!(
                "batch_size {} exceeds the maximum of {}",
                request.batch_size, self.config.max_batch_size
            )));
        }
        let buffer_capacity = request
            .buffer_capacity
            .unwrap_or(self.shuffle.default_buffer_capacity);
        if buffer_capacity > self.shuffle.max_buffer_capacity {
            return Err(LoaderError::invalid_argument(format!(
                "buffer_capacity {buffer_capacity} exceeds the maximum of {}",
                self.shuffle.max_buffer_capacity
            )));
        }

        // Cheap early rejection before building the shuffle buffer
        if self.sessions.read().await.len() >= self.config.max_sessions {
            return Err(LoaderError::TooManySessions {
                limit: self.config.max_sessions,
            });
        }

        let session_id = Uuid::new_v4().to_string();
        let options = SessionOptions {
            seed: request.seed,
            batch_size: request.batch_size,
            epoch_policy: request.epoch_policy,
            buffer_capacity,
            resume: request.resume,
        };
        let session = Session::open(session_id.clone(), Arc::clone(&snapshot), options)?;
        let slot = Arc::new(SessionSlot::new(session));

        {
            let mut sessions = self.sessions.write().await;
            if sessions.len() >= self.config.max_sessions {
                return Err(LoaderError::TooManySessions {
                    limit: self.config.max_sessions,
                });
            }
            sessions.insert(session_id.clone(), Arc::clone(&slot));
        }

        tracing::info!(
            "Opened session {} on {} (seed {}, batch {}, {}, capacity {})",
            session_id,
            snapshot.id(),
            request.seed,
            request.batch_size,
            request.epoch_policy,
            buffer_capacity
        );

        Ok(slot)
    }

    /// Looks up a live session, expiring it first if it sat idle too long.
    ///
    /// # Errors
    ///
    /// `SessionClosed`/`SessionExpired` for ended sessions,
    /// `SessionNotFound` for ids never issued (or forgotten).
    pub async fn get(&self, session_id: &str) -> Result<Arc<SessionSlot>> {
        let slot = self.sessions.read().await.get(session_id).cloned();

        match slot {
            Some(slot) if slot.phase(self.config.idle_ttl()) == SessionPhase::Expired => {
                self.end(session_id, EndReason::Expired).await;
                Err(LoaderError::SessionExpired {
                    context: slot.context(),
                })
            }
            Some(slot) => {
                slot.touch();
                Ok(slot)
            }
            None => match self.tombstones.read().await.get(session_id) {
                Some(tombstone) => Err(tombstone.error(session_id)),
                None => Err(LoaderError::session_not_found(session_id)),
            },
        }
    }

    /// Serves the next batch of a session.
    ///
    /// # Errors
    ///
    /// `SessionBusy` when another batch for the same session is still in
    /// flight; lookup errors from [`get`](SessionStore::get); read errors
    /// from the batch itself.
    pub async fn next_batch(&self, session_id: &str, assembler: &BatchAssembler) -> Result<Batch> {
        let slot = self.get(session_id).await?;
        let mut session = Arc::clone(&slot.session)
            .try_lock_owned()
            .map_err(|_| LoaderError::SessionBusy {
                context: slot.context(),
            })?;

        let result = session.next_batch(assembler).await;
        slot.record(&session);
        slot.served.store(true, Ordering::Release);
        slot.touch();

        // Closed or expired while this batch was in flight
        if !self.sessions.read().await.contains_key(session_id) {
            if let Some(tombstone) = self.tombstones.write().await.get_mut(session_id) {
                tombstone.refresh(&slot);
            }
        }

        result
    }

    /// Closes a session. Returns `false` if it was not open.
    ///
    /// A batch already in flight may still complete; later requests see
    /// `SessionClosed`.
    pub async fn close(&self, session_id: &str) -> bool {
        self.end(session_id, EndReason::Closed).await
    }

    /// Reports a session's position and phase. Closed and expired sessions
    /// are still described until their tombstone is forgotten.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` for ids never issued (or forgotten).
    pub async fn describe(&self, session_id: &str) -> Result<SessionInfo> {
        match self.get(session_id).await {
            Ok(slot) => Ok(slot.info(self.config.idle_ttl())),
            Err(err @ (LoaderError::SessionClosed { .. } | LoaderError::SessionExpired { .. })) => self
                .tombstones
                .read()
                .await
                .get(session_id)
                .map(|tombstone| tombstone.info.clone())
                .ok_or(err),
            Err(err) => Err(err),
        }
    }

    /// Number of open sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Expires idle sessions and forgets old tombstones. Returns the ids
    /// expired by this pass.
    pub async fn reap(&self) -> Vec<String> {
        let idle_ttl = self.config.idle_ttl();
        let expired: Vec<String> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|slot| slot.phase(idle_ttl) == SessionPhase::Expired)
            .map(|slot| slot.id.clone())
            .collect();

        for session_id in &expired {
            self.end(session_id, EndReason::Expired).await;
        }

        let tombstone_ttl = self.config.tombstone_ttl();
        self.tombstones
            .write()
            .await
            .retain(|_, tombstone| tombstone.at.elapsed() <= tombstone_ttl);

        expired
    }

    async fn end(&self, session_id: &str, reason: EndReason) -> bool {
        let Some(slot) = self.sessions.write().await.remove(session_id) else {
            return false;
        };

        let (epoch_index, cursor) = {
            // Read the position under the lock so a batch finishing now
            // either lands here or refreshes the tombstone afterwards
            let mut tombstones = self.tombstones.write().await;
            let tombstone = Tombstone::new(&slot, reason);
            let position = (tombstone.info.epoch_index, tombstone.info.cursor);
            tombstones.insert(session_id.to_string(), tombstone);
            position
        };

        match reason {
            EndReason::Closed => tracing::info!(
                "Closed session {} at epoch {} cursor {}",
                session_id,
                epoch_index,
                cursor
            ),
            EndReason::Expired => tracing::info!(
                "Session {} expired after {:?} idle at epoch {} cursor {}",
                session_id,
                slot.idle_for(),
                epoch_index,
                cursor
            ),
        }
        true
    }
}
