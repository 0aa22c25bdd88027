//! One enumeration run.
//!
//! A [`Session`] bundles the run's immutable configuration, its mutable
//! [`Scope`], the [`AssetCache`] in front of its graph store, progress
//! statistics and a one-shot cancellation signal.
//!
//! # Lifecycle
//!
//! ```text
//! Active ──kill()──► Cancelling ──delete()──► Terminated
//! ```
//!
//! `kill` broadcasts the done signal exactly once. In-flight handlers keep
//! running and observe the signal at their next check. `delete` releases
//! resources and must only run once the statistics show quiescence; the
//! [`SessionManager`](crate::manager::SessionManager) enforces that.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashSet;
use serde::Serialize;
use tempfile::TempDir;
use tokio::sync::{broadcast, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Span};
use uuid::Uuid;

use crate::asn::AsnCache;
use crate::cache::AssetCache;
use crate::config::Config;
use crate::error::{EngineError, StoreError};
use crate::model::EntityId;
use crate::scope::Scope;
use crate::store::GraphStore;
use crate::telemetry::{self, SessionLogRecord};

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    work_items_total: u64,
    work_items_completed: u64,
    handler_failures: u64,
}

/// Work-item counters, mutated under one dedicated lock.
///
/// A work item is one routed event or one handler invocation. The session
/// is quiescent when every counted item has completed.
#[derive(Debug, Default)]
pub struct SessionStats {
    inner: Mutex<Counters>,
}

/// Point-in-time copy of [`SessionStats`] for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub work_items_total: u64,
    pub work_items_completed: u64,
    pub handler_failures: u64,
}

impl StatsSnapshot {
    pub fn is_quiescent(&self) -> bool {
        self.work_items_completed >= self.work_items_total
    }
}

impl SessionStats {
    fn lock(&self) -> MutexGuard<'_, Counters> {
        // Counters stay consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_total(&self, n: u64) {
        self.lock().work_items_total += n;
    }

    pub fn complete(&self, n: u64) {
        self.lock().work_items_completed += n;
    }

    pub fn record_failure(&self) {
        self.lock().handler_failures += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = self.lock();
        StatsSnapshot {
            work_items_total: c.work_items_total,
            work_items_completed: c.work_items_completed,
            handler_failures: c.handler_failures,
        }
    }

    pub fn is_quiescent(&self) -> bool {
        self.snapshot().is_quiescent()
    }

    /// Count `n` new items and return a guard that completes them on drop.
    pub fn begin(self: &Arc<Self>, n: u64) -> WorkGuard {
        self.add_total(n);
        WorkGuard {
            stats: self.clone(),
            count: n,
        }
    }

    /// Guard for items that were already counted when they were queued.
    pub fn adopt(self: &Arc<Self>, n: u64) -> WorkGuard {
        WorkGuard {
            stats: self.clone(),
            count: n,
        }
    }
}

/// RAII receipt for counted work. Completes its items when dropped, so a
/// panicking callback cannot leave the session permanently busy.
pub struct WorkGuard {
    stats: Arc<SessionStats>,
    count: u64,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.stats.complete(self.count);
    }
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Active,
    Cancelling,
    Terminated,
}

pub struct Session {
    id: Uuid,
    config: Arc<Config>,
    scope: Scope,
    cache: AssetCache,
    store: Arc<dyn GraphStore>,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
    tmp_path: PathBuf,
    tmp_dir: Mutex<Option<TempDir>>,
    events: DashSet<EntityId>,
    span: Span,
    logs: broadcast::Sender<SessionLogRecord>,
    asn_cache: OnceCell<Arc<AsnCache>>,
}

impl Session {
    /// Assemble a session around an already connected store.
    pub fn new(config: Arc<Config>, store: Arc<dyn GraphStore>) -> Result<Self, EngineError> {
        let id = Uuid::new_v4();

        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("session-");
            b
        };
        let tmp_dir = match &config.output_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    EngineError::SessionSetup(format!(
                        "failed to create output directory {}: {}",
                        dir.display(),
                        e
                    ))
                })?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| EngineError::SessionSetup(format!("failed to create temp directory: {}", e)))?;

        let span = info_span!("session", id = %id);
        let logs = telemetry::open_session_sink(id);
        let scope = Scope::from_config(&config);
        let cache = AssetCache::new(store.clone());

        info!(
            session = %id,
            domains = ?scope.domains(),
            tmp_dir = %tmp_dir.path().display(),
            "Session created"
        );

        Ok(Self {
            id,
            config,
            scope,
            cache,
            store,
            stats: Arc::new(SessionStats::default()),
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState::Active),
            tmp_path: tmp_dir.path().to_path_buf(),
            tmp_dir: Mutex::new(Some(tmp_dir)),
            events: DashSet::new(),
            span,
            logs,
            asn_cache: OnceCell::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    /// Token observed by every long-running wait on behalf of this session.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Span that dispatched callbacks run inside.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Follow the log events emitted inside this session's span.
    ///
    /// Only events recorded after the call are delivered.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<SessionLogRecord> {
        self.logs.subscribe()
    }

    /// Scratch directory owned by this session, removed on delete.
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_path
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    /// True once the session has been killed.
    pub fn done(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the session is killed.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Broadcast the done signal. Returns `false` if it was already sent.
    pub fn kill(&self) -> bool {
        let mut state = self.lock_state();
        if *state != SessionState::Active {
            return false;
        }
        *state = SessionState::Cancelling;
        self.cancel.cancel();
        info!(session = %self.id, "Session cancelled");
        true
    }

    /// Record that `entity` is being dispatched. Returns `false` if it already was.
    pub(crate) fn mark_dispatched(&self, entity: EntityId) -> bool {
        self.events.insert(entity)
    }

    /// Number of distinct entities dispatched so far.
    pub fn dispatched_count(&self) -> usize {
        self.events.len()
    }

    /// Release the cache, temp directory and store. Idempotent.
    pub async fn delete(&self) -> Result<(), EngineError> {
        {
            let mut state = self.lock_state();
            if *state == SessionState::Terminated {
                return Ok(());
            }
            *state = SessionState::Terminated;
        }
        self.cancel.cancel();
        self.cache.close();

        let tmp = self
            .tmp_dir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dir) = tmp {
            if let Err(e) = dir.close() {
                warn!(session = %self.id, error = %e, "Failed to remove session temp directory");
            }
        }

        match self.store.close().await {
            Ok(()) | Err(StoreError::Closed) => {}
            Err(e) => {
                warn!(session = %self.id, error = %e, "Failed to close graph store");
                return Err(e.into());
            }
        }

        info!(session = %self.id, "Session terminated");
        Ok(())
    }

    /// Address-to-ASN lookup table, loaded from the store on first use.
    pub async fn asn_cache(&self) -> Result<Arc<AsnCache>, StoreError> {
        self.asn_cache
            .get_or_try_init(|| async {
                let cache = AsnCache::load(self.store.as_ref(), None).await?;
                info!(session = %self.id, prefixes = cache.len(), "ASN cache loaded");
                Ok::<_, StoreError>(Arc::new(cache))
            })
            .await
            .cloned()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        telemetry::close_session_sink(self.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}
