//! # Surface Engine
//!
//! An attack-surface discovery engine. Given seed domains, independent
//! data-source plugins discover related assets (names, addresses, netblocks,
//! autonomous systems, registration records) and fold every finding back
//! into a shared asset graph, where it drives further discovery.
//!
//! ## Architecture
//!
//! ```text
//! SessionManager ──► Session { Config, Scope, AssetCache ─► GraphStore, SessionStats }
//!                        │
//!   Dispatcher::seed ────┘
//!        │
//!        ▼ dispatch_event
//!   work queue ─► fan-out ─► Handler (priority order, slots, rate limit)
//!        ▲                        │
//!        │                        ▼ create_asset
//!        └── scope check ◄── AssetCache (new entity)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One node per content key**: concurrent creations of the same asset
//!    resolve to a single entity.
//! 2. **Each entity is dispatched at most once per session.**
//! 3. **Handlers start in priority order**; completion order is unspecified.
//! 4. **No handler error crosses the dispatcher**: failures are logged and counted.
//! 5. **Resources outlive work**: a cancelled session is torn down only when
//!    `work_items_completed == work_items_total`.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use surface_engine::{Config, Dispatcher, MemoryConnector, Registry, SessionManager};
//!
//! let registry = Arc::new(Registry::new());
//! registry.start_plugins(plugins).await;
//!
//! let manager = SessionManager::new(Arc::new(MemoryConnector));
//! let session = manager.new_session(Config::from_env()?).await?;
//!
//! let dispatcher = Dispatcher::new(registry.clone());
//! dispatcher.attach(&session);
//! dispatcher.seed(&session).await?;
//!
//! // ... later
//! manager.cancel_session(session.id()).await?;
//! registry.stop_plugins().await;
//! ```

pub mod asn;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod model;
pub mod registry;
pub mod scope;
pub mod session;
pub mod store;
pub mod support;
pub mod telemetry;
pub mod traversal;

pub use asn::{summarize, AsnCache, AsnEntry, AsnReport, AsnSummary};
pub use cache::AssetCache;
pub use config::{Config, DatabaseConfig, SourceSettings, Transformation};
pub use dispatch::{Dispatcher, Event};
pub use error::{EngineError, RegistryError, Result, StoreError, TraversalError};
pub use manager::SessionManager;
pub use model::{
    Asset, AssetType, ContentKey, Edge, EdgeId, Entity, EntityId, Property, Relation, Source,
};
pub use registry::{handler_fn, EventHandler, Handler, Plugin, Registry};
pub use scope::{Scope, ScopeMatch};
pub use session::{Session, SessionState, SessionStats, StatsSnapshot};
pub use store::{
    GraphStore, InMemoryGraphStore, MemoryConnector, StoreConnector, StoreDescriptor, StoreEngine,
};
pub use traversal::{names_to_addrs, read_as_prefixes, NameAddrPair};
