//! Plugin and handler registry.
//!
//! Plugins register [`Handler`]s at startup. Each handler is bound to one
//! [`AssetType`]; the registry keeps the handlers for a type ordered by
//! ascending priority with registration order breaking ties, which is the
//! order the dispatcher initiates them in.
//!
//! # Registration Rules
//!
//! - A (plugin, event type, name) triple can be registered once.
//! - Handlers are immutable after registration.
//! - `max_instances == 0` means the handler has no concurrency ceiling.
//!
//! # Example
//!
//! ```ignore
//! registry.register_handler(
//!     Handler::new("RDAP", "RDAP-Netblock-Handler", AssetType::Netblock, netblock_handler)
//!         .with_priority(9)
//!         .with_transforms([AssetType::IpNetRecord]),
//! )?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use governor::DefaultDirectRateLimiter;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::dispatch::Event;
use crate::error::RegistryError;
use crate::model::AssetType;

/// Priority given to handlers that do not set one.
pub const DEFAULT_PRIORITY: u32 = 5;

// =============================================================================
// Traits
// =============================================================================

/// Callback invoked for every event of a handler's type.
///
/// Errors are logged and counted by the dispatcher; they never reach other
/// handlers or cancel the session.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

/// Wrap `f` as an event handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// A data-source plugin.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Register this plugin's handlers.
    async fn start(&self, registry: &Registry) -> anyhow::Result<()>;

    /// Release the plugin's own resources.
    async fn stop(&self) {}
}

// =============================================================================
// Handler
// =============================================================================

/// Registration record for one callback.
#[derive(Clone)]
pub struct Handler {
    pub plugin: String,
    pub name: String,
    pub priority: u32,
    pub max_instances: usize,
    pub event_type: AssetType,
    /// Asset types this handler may produce.
    pub transforms: Vec<AssetType>,
    pub rate_limit: Option<Arc<DefaultDirectRateLimiter>>,
    pub callback: Arc<dyn EventHandler>,
}

impl Handler {
    pub fn new(
        plugin: impl Into<String>,
        name: impl Into<String>,
        event_type: AssetType,
        callback: impl EventHandler,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            name: name.into(),
            priority: DEFAULT_PRIORITY,
            max_instances: 0,
            event_type,
            transforms: Vec::new(),
            rate_limit: None,
            callback: Arc::new(callback),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    pub fn with_transforms(mut self, transforms: impl IntoIterator<Item = AssetType>) -> Self {
        self.transforms = transforms.into_iter().collect();
        self
    }

    pub fn with_rate_limit(mut self, limiter: Arc<DefaultDirectRateLimiter>) -> Self {
        self.rate_limit = Some(limiter);
        self
    }

    /// Whether this handler may produce assets of `asset_type`.
    pub fn transforms_to(&self, asset_type: AssetType) -> bool {
        self.transforms.contains(&asset_type)
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("plugin", &self.plugin)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("max_instances", &self.max_instances)
            .field("event_type", &self.event_type)
            .field("transforms", &self.transforms)
            .field("rate_limited", &self.rate_limit.is_some())
            .finish()
    }
}

/// A handler plus its admission-control state.
#[derive(Debug)]
pub(crate) struct RegisteredHandler {
    pub(crate) handler: Handler,
    pub(crate) slots: Option<Arc<Semaphore>>,
    seq: u64,
}

impl RegisteredHandler {
    fn order(&self) -> (u32, u64) {
        (self.handler.priority, self.seq)
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Default)]
pub struct Registry {
    handlers: RwLock<HashMap<AssetType, Vec<Arc<RegisteredHandler>>>>,
    plugins: tokio::sync::Mutex<Vec<Arc<dyn Plugin>>>,
    next_seq: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // Registration is all-or-nothing per call, so a poisoned map is still valid.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<AssetType, Vec<Arc<RegisteredHandler>>>> {
        self.handlers.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<AssetType, Vec<Arc<RegisteredHandler>>>> {
        self.handlers.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register_handler(&self, handler: Handler) -> Result<(), RegistryError> {
        if handler.name.trim().is_empty() || handler.plugin.trim().is_empty() {
            return Err(RegistryError::InvalidHandler {
                name: handler.name,
                reason: "plugin and handler names must not be empty".into(),
            });
        }

        let mut map = self.write();
        let list = map.entry(handler.event_type).or_default();
        if list
            .iter()
            .any(|r| r.handler.plugin == handler.plugin && r.handler.name == handler.name)
        {
            return Err(RegistryError::DuplicateHandler {
                plugin: handler.plugin,
                event_type: handler.event_type,
                name: handler.name,
            });
        }

        info!(
            plugin = %handler.plugin,
            handler = %handler.name,
            event_type = %handler.event_type,
            priority = handler.priority,
            "Handler registered"
        );

        let slots = (handler.max_instances > 0)
            .then(|| Arc::new(Semaphore::new(handler.max_instances)));
        list.push(Arc::new(RegisteredHandler {
            handler,
            slots,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        }));
        list.sort_by_key(|r| r.order());
        Ok(())
    }

    /// Handlers for `event_type` in initiation order. Empty if none.
    pub(crate) fn handlers_for(&self, event_type: AssetType) -> Vec<Arc<RegisteredHandler>> {
        self.read().get(&event_type).cloned().unwrap_or_default()
    }

    /// Registration records for `event_type` in initiation order.
    pub fn handlers(&self, event_type: AssetType) -> Vec<Handler> {
        self.handlers_for(event_type)
            .iter()
            .map(|r| r.handler.clone())
            .collect()
    }

    pub fn handler_count(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    /// Withdraw `plugin`'s handlers registered at or after `first_seq`.
    fn remove_plugin_handlers(&self, plugin: &str, first_seq: u64) {
        let mut map = self.write();
        for list in map.values_mut() {
            list.retain(|r| r.handler.plugin != plugin || r.seq < first_seq);
        }
        map.retain(|_, list| !list.is_empty());
    }

    /// Start every plugin. A plugin that fails is logged and the handlers its
    /// failed start registered are withdrawn. Other plugins, including an
    /// already started one of the same name, keep theirs.
    pub async fn start_plugins(
        &self,
        plugins: impl IntoIterator<Item = Arc<dyn Plugin>>,
    ) -> Vec<RegistryError> {
        let mut failures = Vec::new();

        for plugin in plugins {
            let name = plugin.name().to_string();
            let first_seq = self.next_seq.load(Ordering::SeqCst);
            match plugin.start(self).await {
                Ok(()) => {
                    info!(plugin = %name, "Plugin started");
                    self.plugins.lock().await.push(plugin);
                }
                Err(e) => {
                    error!(plugin = %name, error = %e, "Plugin failed to start");
                    self.remove_plugin_handlers(&name, first_seq);
                    failures.push(RegistryError::PluginStart {
                        plugin: name,
                        source: e,
                    });
                }
            }
        }

        failures
    }

    /// Stop started plugins, most recently started first.
    pub async fn stop_plugins(&self) {
        let plugins: Vec<_> = self.plugins.lock().await.drain(..).collect();
        for plugin in plugins.into_iter().rev() {
            plugin.stop().await;
            info!(plugin = %plugin.name(), "Plugin stopped");
        }
    }

    /// Names of the plugins currently started.
    pub async fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .lock()
            .await
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.handler_count())
            .finish_non_exhaustive()
    }
}
