//! Graph store boundary.
//!
//! The engine never talks to a database directly. It depends on the
//! [`GraphStore`] repository interface (create/find entities and edges,
//! query by content, query by time) and on a [`StoreConnector`] that turns
//! the configured primary database into a live store handle.
//!
//! # Contract
//!
//! - Each call is individually atomic and consistent as of its `since`
//!   argument. No cross-call transactions are assumed.
//! - `create_entity` is an upsert keyed by [`ContentKey`](crate::model::ContentKey):
//!   the store enforces at most one node per key, the cache in front of it
//!   serializes racing creations on top of that.
//! - `since` filters on `last_seen >= since`; `None` disables the filter.
//! - After `close()` every call fails with [`StoreError::Closed`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{
    Asset, AssetType, Edge, EdgeId, EdgeProperty, Entity, EntityId, EntityProperty, Property,
    Relation,
};

mod memory;

pub use memory::InMemoryGraphStore;

/// Outcome of an upsert: the stored record and whether this call created it.
#[derive(Debug, Clone, PartialEq)]
pub struct Upsert<T> {
    pub record: T,
    pub created: bool,
}

/// Repository-style interface to the asset graph.
#[async_trait]
pub trait GraphStore: Send + Sync + 'static {
    /// Create the entity for `asset`, or refresh and return the existing one.
    async fn create_entity(&self, asset: &Asset) -> Result<Upsert<Entity>, StoreError>;

    /// Create a directed edge, idempotent on (from, to, relation key).
    async fn create_edge(
        &self,
        relation: &Relation,
        from: EntityId,
        to: EntityId,
    ) -> Result<Upsert<Edge>, StoreError>;

    async fn create_entity_property(
        &self,
        entity: EntityId,
        property: &Property,
    ) -> Result<EntityProperty, StoreError>;

    async fn create_edge_property(
        &self,
        edge: EdgeId,
        property: &Property,
    ) -> Result<EdgeProperty, StoreError>;

    async fn find_entity_by_id(&self, id: EntityId) -> Result<Entity, StoreError>;

    async fn find_entity_by_content(
        &self,
        asset: &Asset,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, StoreError>;

    /// Same query as [`find_entity_by_content`](Self::find_entity_by_content);
    /// kept as its own entry point for stores that index the two differently.
    async fn find_by_content(
        &self,
        asset: &Asset,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, StoreError> {
        self.find_entity_by_content(asset, since).await
    }

    /// Entities inside the scope described by `assets`: FQDNs at or below a
    /// given name, addresses inside a given netblock, the given AS itself.
    async fn find_by_scope(
        &self,
        assets: &[Asset],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, StoreError>;

    async fn find_entities_by_type(
        &self,
        asset_type: AssetType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>, StoreError>;

    /// Outgoing edges; an empty `labels` slice matches every label.
    async fn outgoing_edges(
        &self,
        entity: EntityId,
        since: Option<DateTime<Utc>>,
        labels: &[&str],
    ) -> Result<Vec<Edge>, StoreError>;

    async fn incoming_edges(
        &self,
        entity: EntityId,
        since: Option<DateTime<Utc>>,
        labels: &[&str],
    ) -> Result<Vec<Edge>, StoreError>;

    /// Entity properties; an empty `names` slice matches every name.
    async fn entity_properties(
        &self,
        entity: EntityId,
        since: Option<DateTime<Utc>>,
        names: &[&str],
    ) -> Result<Vec<EntityProperty>, StoreError>;

    async fn edge_properties(
        &self,
        edge: EdgeId,
        since: Option<DateTime<Utc>>,
        names: &[&str],
    ) -> Result<Vec<EdgeProperty>, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

// =============================================================================
// Connection descriptors
// =============================================================================

/// Storage engine behind a session's graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreEngine {
    Postgres,
    Sqlite,
    Memory,
}

impl StoreEngine {
    pub fn parse(system: &str) -> Option<Self> {
        match system.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Some(StoreEngine::Postgres),
            "sqlite" | "sqlite3" => Some(StoreEngine::Sqlite),
            "memory" | "inmemory" => Some(StoreEngine::Memory),
            _ => None,
        }
    }
}

impl fmt::Display for StoreEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreEngine::Postgres => f.write_str("postgres"),
            StoreEngine::Sqlite => f.write_str("sqlite"),
            StoreEngine::Memory => f.write_str("memory"),
        }
    }
}

/// Resolved connection details for the primary database.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreDescriptor {
    pub engine: StoreEngine,
    pub dsn: String,
}

impl StoreDescriptor {
    pub fn memory() -> Self {
        Self {
            engine: StoreEngine::Memory,
            dsn: String::new(),
        }
    }
}

// The DSN may embed a password.
impl fmt::Debug for StoreDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreDescriptor")
            .field("engine", &self.engine)
            .field("dsn", &if self.dsn.is_empty() { "" } else { "<redacted>" })
            .finish()
    }
}

/// Opens a graph store for a descriptor.
#[async_trait]
pub trait StoreConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        descriptor: &StoreDescriptor,
    ) -> Result<Arc<dyn GraphStore>, StoreError>;
}

/// Connector for the in-process store. Relational engines need their own connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryConnector;

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(
        &self,
        descriptor: &StoreDescriptor,
    ) -> Result<Arc<dyn GraphStore>, StoreError> {
        match descriptor.engine {
            StoreEngine::Memory => Ok(Arc::new(InMemoryGraphStore::new())),
            other => Err(StoreError::Unsupported {
                engine: other.to_string(),
            }),
        }
    }
}
