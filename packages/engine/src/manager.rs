//! Process-wide registry of enumeration sessions.
//!
//! The manager is constructed explicitly by the process entry point and
//! shut down explicitly at exit.
//!
//! # Cancellation
//!
//! [`SessionManager::cancel_session`] kills the session, then polls its
//! statistics until every counted work item has completed. Only then are
//! the cache, temp directory and store released, so no handler can be left
//! writing to a closed store.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::session::Session;
use crate::store::StoreConnector;

pub struct SessionManager {
    connector: Arc<dyn StoreConnector>,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn StoreConnector>) -> Self {
        Self {
            connector,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Connect the configured primary store and register a new session on it.
    pub async fn new_session(&self, config: Config) -> Result<Arc<Session>> {
        let descriptor = config.primary_store()?;
        debug!(engine = %descriptor.engine, "Connecting session store");

        let store = self.connector.connect(&descriptor).await?;
        let session = match Session::new(Arc::new(config), store.clone()) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                if let Err(close_err) = store.close().await {
                    warn!(error = %close_err, "Failed to close store after setup failure");
                }
                return Err(e);
            }
        };

        self.add_session(session.clone()).await?;
        Ok(session)
    }

    /// Register an externally built session.
    pub async fn add_session(&self, session: Arc<Session>) -> Result<Uuid> {
        let id = session.id();
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(EngineError::SessionSetup(format!(
                "session {} is already registered",
                id
            )));
        }
        sessions.insert(id, session);
        info!(session = %id, active = sessions.len(), "Session registered");
        Ok(id)
    }

    pub async fn get_session(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Like [`get_session`](Self::get_session), but unknown ids are an error.
    pub async fn session(&self, id: Uuid) -> Result<Arc<Session>> {
        self.get_session(id)
            .await
            .ok_or(EngineError::SessionNotFound(id))
    }

    pub async fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Kill a session, wait for its in-flight work to drain, then tear it down.
    pub async fn cancel_session(&self, id: Uuid) -> Result<()> {
        let session = self.session(id).await?;
        session.kill();

        let mut ticker = tokio::time::interval(session.config().poll_interval());
        loop {
            ticker.tick().await;
            let stats = session.stats().snapshot();
            if stats.is_quiescent() {
                break;
            }
            debug!(
                session = %id,
                total = stats.work_items_total,
                completed = stats.work_items_completed,
                "Waiting for in-flight work"
            );
        }

        let result = session.delete().await;
        self.sessions.write().await.remove(&id);
        info!(session = %id, "Session removed");
        result
    }

    /// Cancel every session. Used at process exit.
    pub async fn shutdown(&self) {
        let ids = self.session_ids().await;
        let results = join_all(ids.iter().map(|id| self.cancel_session(*id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!(session = %id, error = %e, "Session did not shut down cleanly");
            }
        }
        info!(sessions = ids.len(), "Session manager shut down");
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::error::StoreError;
    use crate::store::MemoryConnector;
    use std::time::Duration;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(MemoryConnector))
    }

    fn config(dir: &std::path::Path) -> Config {
        Config::new()
            .with_domain("example.com")
            .with_output_dir(dir)
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let mgr = manager();
        let id = Uuid::new_v4();
        assert!(mgr.get_session(id).await.is_none());
        assert!(matches!(
            mgr.session(id).await,
            Err(EngineError::SessionNotFound(found)) if found == id
        ));
        assert!(matches!(
            mgr.cancel_session(id).await,
            Err(EngineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_new_session_is_registered() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        let session = mgr.new_session(config(dir.path())).await.unwrap();
        let found = mgr.session(session.id()).await.unwrap();
        assert!(Arc::ptr_eq(&found, &session));

        let err = mgr.add_session(session.clone()).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionSetup(_)));
    }

    #[tokio::test]
    async fn test_session_setup_fails_without_primary_database() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        let cfg = config(dir.path()).with_database(DatabaseConfig {
            primary: false,
            system: "postgres".into(),
            ..Default::default()
        });
        assert!(matches!(
            mgr.new_session(cfg).await,
            Err(EngineError::NoPrimaryDatabase)
        ));

        let cfg = config(dir.path()).with_database(DatabaseConfig {
            primary: true,
            system: "postgres".into(),
            ..Default::default()
        });
        assert!(matches!(
            mgr.new_session(cfg).await,
            Err(EngineError::Store(StoreError::Unsupported { .. }))
        ));
        assert!(mgr.session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_removes_every_session() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager();
        let a = mgr.new_session(config(dir.path())).await.unwrap();
        let b = mgr.new_session(config(dir.path())).await.unwrap();

        mgr.shutdown().await;

        assert!(mgr.session_ids().await.is_empty());
        assert!(a.done() && b.done());
        assert!(a.cache().is_closed() && b.cache().is_closed());
    }
}
