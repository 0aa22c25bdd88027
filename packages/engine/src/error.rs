//! Structured error types for the discovery engine.
//!
//! Every library seam returns a pattern-matchable error instead of a generic
//! `anyhow::Error`:
//!
//! - [`StoreError`]: the graph store failed or refused a call.
//! - [`TraversalError`]: a DNS walk could not produce an address.
//! - [`RegistryError`]: a plugin tried to register an invalid or duplicate handler.
//! - [`EngineError`]: session and manager level failures.
//!
//! # The Error Boundary Rule
//!
//! > **No handler error ever crosses the dispatcher boundary.**
//!
//! - `anyhow` is the transport inside plugin callbacks (ergonomic for IO)
//! - the dispatcher logs and counts callback failures, it never propagates them
//!
//! Absence is not failure: a name without an address, or a session that finds
//! nothing, is reported through empty results and never through these types,
//! except [`TraversalError`] which callers treat as "resolution failed".

use thiserror::Error;
use uuid::Uuid;

use crate::model::AssetType;

// =============================================================================
// Store Error
// =============================================================================

/// Errors from the graph store behind the asset cache.
///
/// [`StoreError::Closed`] is expected during teardown: a handler that races
/// session deletion observes it and simply yields no finding.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Storage backend failed (timeout, connection, constraint violation).
    #[error("storage backend error: {0}")]
    Backend(#[source] anyhow::Error),

    /// The store (or the cache in front of it) was closed.
    #[error("graph store is closed")]
    Closed,

    /// No connector is available for the requested storage engine.
    #[error("unsupported storage engine: {engine}")]
    Unsupported { engine: String },

    /// A referenced entity or edge does not exist.
    #[error("no stored object with id {id}")]
    NotFound { id: Uuid },
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

// =============================================================================
// Traversal Error
// =============================================================================

/// Reasons a DNS relationship walk failed to reach an address.
///
/// None of these are fatal: the graph is attacker-influenced and many names
/// legitimately have no address.
#[derive(Debug, Error)]
pub enum TraversalError {
    /// The alias chain was longer than the hop bound.
    #[error("alias chain exceeded {hops} hops")]
    HopLimit { hops: usize },

    /// A node was visited twice while following aliases.
    #[error("alias cycle detected at {key}")]
    Cycle { key: String },

    /// The walk ended without reaching an address record.
    #[error("no address reachable from {name}")]
    NoAddress { name: String },

    /// The owning session was cancelled mid-walk.
    #[error("traversal cancelled")]
    Cancelled,

    /// The store failed during the walk.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// Registry Error
// =============================================================================

/// Handler registration failures. Fatal to the plugin that caused them only.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The same (plugin, event type, name) triple was registered twice.
    #[error("handler {name} of plugin {plugin} is already registered for {event_type}")]
    DuplicateHandler {
        plugin: String,
        event_type: AssetType,
        name: String,
    },

    /// The handler record is malformed (e.g. an empty plugin or handler name).
    #[error("invalid handler {name}: {reason}")]
    InvalidHandler { name: String, reason: String },

    /// A plugin's own start routine failed.
    #[error("plugin {plugin} failed to start: {source}")]
    PluginStart {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },
}

// =============================================================================
// Engine Error
// =============================================================================

/// Session and manager level errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Traversal(#[from] TraversalError),

    /// Lookup by an id the manager does not know.
    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    /// The session was cancelled or terminated and accepts no new work.
    #[error("session {0} is closed")]
    SessionClosed(Uuid),

    /// The dispatcher's work queue is no longer being drained.
    #[error("dispatcher is shut down")]
    DispatcherClosed,

    /// The configuration names no usable primary database.
    #[error("no primary database specified in the configuration")]
    NoPrimaryDatabase,

    /// Any other failure while assembling a session (temp dir, cache).
    #[error("session setup failed: {0}")]
    SessionSetup(String),
}

/// Result alias used across the engine.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_handler_message_names_the_triple() {
        let err = RegistryError::DuplicateHandler {
            plugin: "RDAP".into(),
            event_type: AssetType::Netblock,
            name: "RDAP-Netblock-Handler".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("RDAP-Netblock-Handler"));
        assert!(msg.contains("Netblock"));
    }

    #[test]
    fn test_store_error_converts_into_engine_error() {
        let err: EngineError = StoreError::Closed.into();
        assert!(matches!(err, EngineError::Store(StoreError::Closed)));
    }

    #[test]
    fn test_anyhow_becomes_backend_error() {
        let err: StoreError = anyhow::anyhow!("connection reset").into();
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(err.to_string().contains("connection reset"));
    }
}
