//! Write-through asset cache.
//!
//! The [`AssetCache`] sits between plugin handlers and the session's
//! [`GraphStore`]. It memoizes entities by content key and serializes racing
//! creations of the same key, so at most one node exists per key even when
//! many handlers discover the same asset at once.
//!
//! Memoized entities are served without a store round trip only while their
//! `last_seen` is younger than the refresh interval ([`MEMO_REFRESH`] by
//! default). Older hits are upserted again so time-filtered queries still
//! see assets that keep being rediscovered.
//!
//! # Discovery feed
//!
//! When a dispatcher attaches to the session it installs a feed: every entity
//! this cache *creates* (not refreshes) is pushed onto it and becomes a
//! candidate event. The work item is counted in the session statistics
//! before it is sent, so quiescence can never be observed while a fresh
//! discovery is still in the channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use crate::error::StoreError;
use crate::model::{
    Asset, ContentKey, Edge, EdgeId, EdgeProperty, Entity, EntityId, EntityProperty, Property,
    Relation,
};
use crate::session::SessionStats;
use crate::store::GraphStore;

/// Age after which a memoized entity is refreshed through the store.
pub const MEMO_REFRESH: Duration = Duration::from_secs(60);

struct DiscoveryFeed {
    tx: mpsc::UnboundedSender<Entity>,
    stats: Arc<SessionStats>,
}

/// Deduplicating facade over a session's graph store.
pub struct AssetCache {
    store: Arc<dyn GraphStore>,
    entities: DashMap<ContentKey, Entity>,
    key_locks: DashMap<ContentKey, Arc<Mutex<()>>>,
    closed: AtomicBool,
    feed: OnceLock<DiscoveryFeed>,
    refresh_after: TimeDelta,
}

impl AssetCache {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            entities: DashMap::new(),
            key_locks: DashMap::new(),
            closed: AtomicBool::new(false),
            feed: OnceLock::new(),
            refresh_after: TimeDelta::from_std(MEMO_REFRESH).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Serve memoized entities for at most `interval` since they were last seen.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_after = TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX);
        self
    }

    /// Route newly created entities to `tx`. Only the first installation wins.
    pub(crate) fn install_feed(
        &self,
        tx: mpsc::UnboundedSender<Entity>,
        stats: Arc<SessionStats>,
    ) -> bool {
        self.feed.set(DiscoveryFeed { tx, stats }).is_ok()
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of entities memoized by this cache.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn memoized(&self, key: &ContentKey) -> Option<Entity> {
        let entity = self.entities.get(key)?;
        (Utc::now() - entity.last_seen < self.refresh_after).then(|| entity.clone())
    }

    /// Create the node for `asset`, or return the existing one.
    pub async fn create_asset(&self, asset: &Asset) -> Result<Entity, StoreError> {
        self.ensure_open()?;
        let key = asset.key();

        if let Some(entity) = self.memoized(&key) {
            return Ok(entity);
        }

        let lock = self.key_locks.entry(key.clone()).or_default().clone();
        let _guard = lock.lock().await;

        // Another task may have finished the creation while we waited.
        if let Some(entity) = self.memoized(&key) {
            return Ok(entity);
        }
        self.ensure_open()?;

        let upsert = self
            .store
            .create_entity(&asset.normalized())
            .await
            .inspect_err(|e| error!(asset = %asset, error = %e, "Failed to create asset"))?;

        let entity = upsert.record;
        self.entities.insert(key, entity.clone());

        if upsert.created {
            debug!(asset = %entity.asset, entity_id = %entity.id, "New asset stored");
            self.announce(&entity);
        }

        Ok(entity)
    }

    fn announce(&self, entity: &Entity) {
        let Some(feed) = self.feed.get() else {
            return;
        };
        feed.stats.add_total(1);
        if feed.tx.send(entity.clone()).is_err() {
            // Dispatcher is gone; the item will never be processed.
            feed.stats.complete(1);
        }
    }

    /// Create a directed edge between two stored entities.
    pub async fn create_edge(
        &self,
        relation: &Relation,
        from: &Entity,
        to: &Entity,
    ) -> Result<Edge, StoreError> {
        self.ensure_open()?;
        self.store
            .create_edge(relation, from.id, to.id)
            .await
            .map(|upsert| upsert.record)
            .inspect_err(|e| {
                error!(
                    relation = %relation.key(),
                    from = %from.asset,
                    to = %to.asset,
                    error = %e,
                    "Failed to create edge"
                )
            })
    }

    pub async fn create_entity_property(
        &self,
        entity: EntityId,
        property: &Property,
    ) -> Result<EntityProperty, StoreError> {
        self.ensure_open()?;
        self.store
            .create_entity_property(entity, property)
            .await
            .inspect_err(|e| {
                error!(
                    entity_id = %entity,
                    property = %property.name(),
                    error = %e,
                    "Failed to create entity property"
                )
            })
    }

    pub async fn create_edge_property(
        &self,
        edge: EdgeId,
        property: &Property,
    ) -> Result<EdgeProperty, StoreError> {
        self.ensure_open()?;
        self.store
            .create_edge_property(edge, property)
            .await
            .inspect_err(|e| {
                error!(
                    edge_id = %edge,
                    property = %property.name(),
                    error = %e,
                    "Failed to create edge property"
                )
            })
    }

    /// Stop accepting writes. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.entities.clear();
            self.key_locks.clear();
        }
    }
}
