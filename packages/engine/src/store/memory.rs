//! In-process graph store.
//!
//! Backs the `memory` storage engine and doubles as the store used by tests.
//! It enforces the unique content-key constraint itself, so concurrent
//! creations of the same asset resolve to one node even without the cache.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{GraphStore, Upsert};
use crate::error::StoreError;
use crate::model::{
    normalize_name, Asset, AssetType, ContentKey, Edge, EdgeId, EdgeProperty, Entity, EntityId,
    EntityProperty, Property, Relation,
};

#[derive(Default)]
struct Graph {
    entities: HashMap<EntityId, Entity>,
    by_key: HashMap<ContentKey, EntityId>,
    edges: HashMap<EdgeId, Edge>,
    edge_by_key: HashMap<(EntityId, EntityId, String), EdgeId>,
    outgoing: HashMap<EntityId, Vec<EdgeId>>,
    incoming: HashMap<EntityId, Vec<EdgeId>>,
    entity_props: HashMap<EntityId, Vec<EntityProperty>>,
    edge_props: HashMap<EdgeId, Vec<EdgeProperty>>,
}

/// Graph store held entirely in memory.
#[derive(Default)]
pub struct InMemoryGraphStore {
    graph: RwLock<Graph>,
    closed: AtomicBool,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities.
    pub fn entity_count(&self) -> usize {
        self.graph.read().map(|g| g.entities.len()).unwrap_or(0)
    }

    /// Number of stored edges.
    pub fn edge_count(&self) -> usize {
        self.graph.read().map(|g| g.edges.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Graph>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        self.graph
            .read()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Graph>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        self.graph
            .write()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("lock poisoned: {}", e)))
    }
}

impl std::fmt::Debug for InMemoryGraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryGraphStore")
            .field("entities", &self.entity_count())
            .field("edges", &self.edge_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn fresh(last_seen: DateTime<Utc>, since: Option<DateTime<Utc>>) -> bool {
    since.map_or(true, |since| last_seen >= since)
}

fn label_matches(labels: &[&str], label: &str) -> bool {
    labels.is_empty() || labels.iter().any(|l| *l == label)
}

fn in_scope_of(entity: &Entity, scope: &Asset) -> bool {
    match (&entity.asset, scope) {
        (Asset::Fqdn { name }, Asset::Fqdn { name: root }) => {
            let root = normalize_name(root);
            *name == root || name.ends_with(&format!(".{root}"))
        }
        (Asset::IpAddress { address }, Asset::Netblock { cidr }) => cidr.contains(address),
        (Asset::Netblock { cidr: inner }, Asset::Netblock { cidr }) => cidr.contains(inner),
        (a, b) => a.key() == b.key(),
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn create_entity(&self, asset: &Asset) -> Result<Upsert<Entity>, StoreError> {
        let key = asset.key();
        let now = Utc::now();
        let mut graph = self.write()?;

        if let Some(id) = graph.by_key.get(&key).copied() {
            if let Some(entity) = graph.entities.get_mut(&id) {
                entity.last_seen = now;
                return Ok(Upsert {
                    record: entity.clone(),
                    created: false,
                });
            }
        }

        let entity = Entity {
            id: EntityId::new(),
            asset: asset.normalized(),
            created_at: now,
            last_seen: now,
        };
        graph.by_key.insert(key, entity.id);
        graph.entities.insert(entity.id, entity.clone());
        Ok(Upsert {
            record: entity,
            created: true,
        })
    }

    async fn create_edge(
        &self,
        relation: &Relation,
        from: EntityId,
        to: EntityId,
    ) -> Result<Upsert<Edge>, StoreError> {
        let now = Utc::now();
        let mut graph = self.write()?;

        for id in [from, to] {
            if !graph.entities.contains_key(&id) {
                return Err(StoreError::NotFound { id: id.0 });
            }
        }

        let key = (from, to, relation.key());
        if let Some(id) = graph.edge_by_key.get(&key).copied() {
            if let Some(edge) = graph.edges.get_mut(&id) {
                edge.last_seen = now;
                return Ok(Upsert {
                    record: edge.clone(),
                    created: false,
                });
            }
        }

        let edge = Edge {
            id: EdgeId::new(),
            relation: relation.clone(),
            from,
            to,
            created_at: now,
            last_seen: now,
        };
        graph.edge_by_key.insert(key, edge.id);
        graph.outgoing.entry(from).or_default().push(edge.id);
        graph.incoming.entry(to).or_default().push(edge.id);
        graph.edges.insert(edge.id, edge.clone());
        Ok(Upsert {
            record: edge,
            created: true,
        })
    }

    async fn create_entity_property(
        &self,
        entity: EntityId,
        property: &Property,
    ) -> Result<EntityProperty, StoreError> {
        let now = Utc::now();
        let mut graph = self.write()?;
        if !graph.entities.contains_key(&entity) {
            return Err(StoreError::NotFound { id: entity.0 });
        }

        let props = graph.entity_props.entry(entity).or_default();
        if let Some(existing) = props.iter_mut().find(|p| p.property == *property) {
            existing.last_seen = now;
            return Ok(existing.clone());
        }

        let record = EntityProperty {
            id: Uuid::new_v4(),
            entity_id: entity,
            property: property.clone(),
            created_at: now,
            last_seen: now,
        };
        props.push(record.clone());
        Ok(record)
    }

    async fn create_edge_property(
        &self,
        edge: EdgeId,
        property: &Property,
    ) -> Result<EdgeProperty, StoreError> {
        let now = Utc::now();
        let mut graph = self.write()?;
        if !graph.edges.contains_key(&edge) {
            return Err(StoreError::NotFound { id: edge.0 });
        }

        let props = graph.edge_props.entry(edge).or_default();
        if let Some(existing) = props.iter_mut().find(|p| p.property == *property) {
            existing.last_seen = now;
            return Ok(existing.clone());
        }

        let record = EdgeProperty {
            id: Uuid::new_v4(),
            edge_id: edge,
            property: property.clone(),
            created_at: now,
            last_seen: now,
        };
        props.push(record.clone());
        Ok(record)
    }

    async fn find_entity_by_id(&self, id: EntityId) -> Result<Entity, StoreError> {
        self.read()?
            .entities
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { id: id.0 })
    }

    async fn find_entity_by_content(
        &self,
        asset: &Asset,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, StoreError> {
        let graph = self.read()?;
        Ok(graph
            .by_key
            .get(&asset.key())
            .and_then(|id| graph.entities.get(id))
            .filter(|e| fresh(e.last_seen, since))
            .cloned()
            .into_iter()
            .collect())
    }

    async fn find_by_scope(
        &self,
        assets: &[Asset],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, StoreError> {
        let graph = self.read()?;
        let mut seen = HashSet::new();
        let mut results: Vec<Entity> = graph
            .entities
            .values()
            .filter(|e| fresh(e.last_seen, since))
            .filter(|e| assets.iter().any(|scope| in_scope_of(e, scope)))
            .filter(|e| seen.insert(e.id))
            .cloned()
            .collect();
        results.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(results)
    }

    async fn find_entities_by_type(
        &self,
        asset_type: AssetType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, StoreError> {
        let graph = self.read()?;
        let mut results: Vec<Entity> = graph
            .entities
            .values()
            .filter(|e| e.asset_type() == asset_type && fresh(e.last_seen, since))
            .cloned()
            .collect();
        results.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(results)
    }

    async fn outgoing_edges(
        &self,
        entity: EntityId,
        since: Option<DateTime<Utc>>,
        labels: &[&str],
    ) -> Result<Vec<Edge>, StoreError> {
        let graph = self.read()?;
        Ok(graph
            .outgoing
            .get(&entity)
            .into_iter()
            .flatten()
            .filter_map(|id| graph.edges.get(id))
            .filter(|e| fresh(e.last_seen, since) && label_matches(labels, e.relation.label()))
            .cloned()
            .collect())
    }

    async fn incoming_edges(
        &self,
        entity: EntityId,
        since: Option<DateTime<Utc>>,
        labels: &[&str],
    ) -> Result<Vec<Edge>, StoreError> {
        let graph = self.read()?;
        Ok(graph
            .incoming
            .get(&entity)
            .into_iter()
            .flatten()
            .filter_map(|id| graph.edges.get(id))
            .filter(|e| fresh(e.last_seen, since) && label_matches(labels, e.relation.label()))
            .cloned()
            .collect())
    }

    async fn entity_properties(
        &self,
        entity: EntityId,
        since: Option<DateTime<Utc>>,
        names: &[&str],
    ) -> Result<Vec<EntityProperty>, StoreError> {
        let graph = self.read()?;
        Ok(graph
            .entity_props
            .get(&entity)
            .into_iter()
            .flatten()
            .filter(|p| fresh(p.last_seen, since) && label_matches(names, p.property.name()))
            .cloned()
            .collect())
    }

    async fn edge_properties(
        &self,
        edge: EdgeId,
        since: Option<DateTime<Utc>>,
        names: &[&str],
    ) -> Result<Vec<EdgeProperty>, StoreError> {
        let graph = self.read()?;
        Ok(graph
            .edge_props
            .get(&edge)
            .into_iter()
            .flatten()
            .filter(|p| fresh(p.last_seen, since) && label_matches(names, p.property.name()))
            .cloned()
            .collect())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Relation, RR_A, RR_CNAME};

    #[tokio::test]
    async fn test_create_entity_is_upsert() {
        let store = InMemoryGraphStore::new();
        let first = store.create_entity(&Asset::fqdn("www.example.com")).await.unwrap();
        let second = store.create_entity(&Asset::fqdn("WWW.example.com")).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.record.id, second.record.id);
        assert_eq!(store.entity_count(), 1);
    }

    #[tokio::test]
    async fn test_create_edge_is_idempotent_per_relation() {
        let store = InMemoryGraphStore::new();
        let a = store.create_entity(&Asset::fqdn("a.example.com")).await.unwrap().record;
        let b = store.create_entity(&Asset::fqdn("b.example.com")).await.unwrap().record;

        let cname = Relation::BasicDns { rr_type: RR_CNAME };
        let e1 = store.create_edge(&cname, a.id, b.id).await.unwrap();
        let e2 = store.create_edge(&cname, a.id, b.id).await.unwrap();
        assert_eq!(e1.record.id, e2.record.id);

        let a_rec = Relation::BasicDns { rr_type: RR_A };
        let e3 = store.create_edge(&a_rec, a.id, b.id).await.unwrap();
        assert_ne!(e1.record.id, e3.record.id);
        assert_eq!(store.edge_count(), 2);
    }

    #[tokio::test]
    async fn test_edge_to_missing_entity_is_not_found() {
        let store = InMemoryGraphStore::new();
        let a = store.create_entity(&Asset::fqdn("a.example.com")).await.unwrap().record;
        let err = store
            .create_edge(&Relation::simple("node"), a.id, EntityId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_find_by_scope_matches_subdomains_only() {
        let store = InMemoryGraphStore::new();
        for name in ["example.com", "api.example.com", "notexample.com"] {
            store.create_entity(&Asset::fqdn(name)).await.unwrap();
        }

        let found = store
            .find_by_scope(&[Asset::fqdn("example.com")], None)
            .await
            .unwrap();
        let names: Vec<_> = found.iter().filter_map(|e| e.asset.as_fqdn()).collect();
        assert_eq!(names, vec!["api.example.com", "example.com"]);
    }

    #[tokio::test]
    async fn test_since_filters_stale_records() {
        let store = InMemoryGraphStore::new();
        let entity = store.create_entity(&Asset::fqdn("example.com")).await.unwrap().record;
        let later = entity.last_seen + chrono::Duration::seconds(1);

        assert!(store
            .find_entity_by_content(&Asset::fqdn("example.com"), Some(later))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .find_entity_by_content(&Asset::fqdn("example.com"), Some(entity.last_seen))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_closed_store_refuses_calls() {
        let store = InMemoryGraphStore::new();
        store.close().await.unwrap();
        let err = store.create_entity(&Asset::fqdn("example.com")).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }
}
