// Shared harness for engine integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use surface_engine::{Config, Dispatcher, InMemoryGraphStore, Registry, Session, SessionManager};
use surface_engine::store::MemoryConnector;
use tempfile::TempDir;

pub struct Harness {
    pub registry: Arc<Registry>,
    pub dispatcher: Dispatcher,
    pub manager: Arc<SessionManager>,
    pub store: Arc<InMemoryGraphStore>,
    pub session: Arc<Session>,
    _output: TempDir,
}

impl Harness {
    /// Session over a store the test keeps a handle to, rooted at `domains`.
    pub async fn start(registry: Registry, domains: &[&str]) -> Self {
        surface_engine::telemetry::init_tracing("warn,surface_engine=debug");

        let output = tempfile::tempdir().expect("temp dir");
        let config = domains
            .iter()
            .fold(Config::new(), |cfg, d| cfg.with_domain(*d))
            .with_output_dir(output.path())
            .with_poll_interval(Duration::from_millis(10));

        let store = Arc::new(InMemoryGraphStore::new());
        let session = Arc::new(Session::new(Arc::new(config), store.clone()).expect("session"));

        let manager = Arc::new(SessionManager::new(Arc::new(MemoryConnector)));
        manager.add_session(session.clone()).await.expect("register session");

        let registry = Arc::new(registry);
        let dispatcher = Dispatcher::new(registry.clone());
        dispatcher.attach(&session);

        Self {
            registry,
            dispatcher,
            manager,
            store,
            session,
            _output: output,
        }
    }

    /// Wait until every counted work item has completed.
    pub async fn settle(&self) {
        wait_quiescent(&self.session).await;
    }
}

pub async fn wait_quiescent(session: &Session) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !session.stats().is_quiescent() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session did not become quiescent");
}
