//! Event dispatch.
//!
//! Events flow through a work queue instead of recursive calls:
//!
//! ```text
//! dispatch_event ──► mpsc queue ──► dispatcher loop ──► fan-out task (per event)
//!                                                          │
//!                      for each handler, in priority order:│
//!                        acquire slot → wait for rate token → spawn callback
//!
//! AssetCache (new entity) ──► discovery feed ──► scope check ──► dispatch_event
//! ```
//!
//! # Work accounting
//!
//! Every queued event and every handler invocation is one work item in the
//! session's [`SessionStats`](crate::session::SessionStats). Items are counted
//! before they become visible to another task and completed by a drop guard,
//! so `completed == total` really means nothing is left to run.
//!
//! # Cancellation
//!
//! The session's token is checked once per dequeue and raced against every
//! blocking wait (slot acquisition, rate limiter). In-flight callbacks are
//! never interrupted.

use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use crate::error::{EngineError, Result};
use crate::model::{Asset, Entity};
use crate::registry::{Registry, RegisteredHandler};
use crate::session::{Session, SessionStats};

/// One asset routed to the handlers registered for its type.
#[derive(Clone)]
pub struct Event {
    pub name: String,
    pub entity: Entity,
    pub session: Arc<Session>,
    pub dispatcher: Dispatcher,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("entity", &self.entity.id)
            .field("session", &self.session.id())
            .finish()
    }
}

struct Inner {
    registry: Arc<Registry>,
    queue: mpsc::UnboundedSender<Event>,
    shutdown: CancellationToken,
}

/// Routes events to handlers. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher and spawn its queue loop on the current runtime.
    pub fn new(registry: Arc<Registry>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(run_queue(registry.clone(), rx, shutdown.clone()));

        Self {
            inner: Arc::new(Inner {
                registry,
                queue: tx,
                shutdown,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Stop draining the queue. Queued events are completed without running.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Queue `entity` for the session's handlers.
    ///
    /// Returns `Ok(false)` when the entity was already dispatched in this
    /// session.
    pub fn dispatch_event(&self, session: &Arc<Session>, entity: Entity) -> Result<bool> {
        if session.done() {
            return Err(EngineError::SessionClosed(session.id()));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::DispatcherClosed);
        }
        if !session.mark_dispatched(entity.id) {
            return Ok(false);
        }

        let stats = session.stats().clone();
        stats.add_total(1);

        let event = Event {
            name: entity.asset.to_string(),
            entity,
            session: session.clone(),
            dispatcher: self.clone(),
        };
        if self.inner.queue.send(event).is_err() {
            stats.complete(1);
            return Err(EngineError::DispatcherClosed);
        }
        Ok(true)
    }

    /// Route the session's newly discovered assets back into dispatch.
    ///
    /// Returns `false` if the session was already attached.
    pub fn attach(&self, session: &Arc<Session>) -> bool {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = session.stats().clone();
        if !session.cache().install_feed(tx, stats.clone()) {
            return false;
        }

        tokio::spawn(forward_discoveries(
            self.clone(),
            Arc::downgrade(session),
            stats,
            rx,
        ));
        true
    }

    /// Create and dispatch a node for every root domain in the session scope.
    ///
    /// Returns the number of roots seeded.
    pub async fn seed(&self, session: &Arc<Session>) -> Result<usize> {
        let mut seeded = 0;
        for domain in session.scope().domains() {
            let entity = session.cache().create_asset(&Asset::fqdn(domain)).await?;
            // An attached feed may have queued it already.
            self.dispatch_event(session, entity)?;
            seeded += 1;
        }
        info!(session = %session.id(), seeded, "Session seeded");
        Ok(seeded)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.inner.registry)
            .field("shut_down", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

// =============================================================================
// Tasks
// =============================================================================

async fn run_queue(
    registry: Arc<Registry>,
    mut rx: mpsc::UnboundedReceiver<Event>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        tokio::spawn(fan_out(registry.clone(), event));
    }

    rx.close();
    while let Ok(event) = rx.try_recv() {
        event.session.stats().complete(1);
    }
    debug!("Dispatcher queue stopped");
}

async fn fan_out(registry: Arc<Registry>, event: Event) {
    let session = event.session.clone();
    let _routed = session.stats().adopt(1);

    if session.done() {
        return;
    }

    let handlers = registry.handlers_for(event.entity.asset_type());
    if handlers.is_empty() {
        return;
    }

    let cancel = session.cancel_token();
    for registered in handlers {
        let permit = match &registered.slots {
            Some(slots) => tokio::select! {
                _ = cancel.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => continue,
                },
            },
            None => None,
        };

        if let Some(limiter) = &registered.handler.rate_limit {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = limiter.until_ready() => {}
            }
        }

        let work = session.stats().begin(1);
        let (started_tx, started_rx) = oneshot::channel();
        let event = event.clone();
        let span = session.span().clone();

        tokio::spawn(
            async move {
                let _work = work;
                let _permit = permit;
                let _ = started_tx.send(());
                invoke(&registered, &event).await;
            }
            .instrument(span),
        );

        // Next handler is not initiated before this one has begun.
        let _ = started_rx.await;
    }
}

async fn invoke(registered: &RegisteredHandler, event: &Event) {
    let handler = &registered.handler;
    if let Err(e) = handler.callback.handle(event).await {
        event.session.stats().record_failure();
        error!(
            plugin = %handler.plugin,
            handler = %handler.name,
            event_type = %handler.event_type,
            asset = %event.entity.asset,
            error = %e,
            "Handler failed"
        );
    }
}

async fn forward_discoveries(
    dispatcher: Dispatcher,
    session: Weak<Session>,
    stats: Arc<SessionStats>,
    mut rx: mpsc::UnboundedReceiver<Entity>,
) {
    while let Some(entity) = rx.recv().await {
        // Counted by the cache when it was sent.
        let _item = stats.adopt(1);

        let Some(session) = session.upgrade() else {
            continue;
        };
        if session.done() {
            continue;
        }

        let min_confidence = session.config().min_confidence;
        match session.scope().is_asset_in_scope(&entity.asset, min_confidence) {
            Some(_) => {
                if let Err(e) = dispatcher.dispatch_event(&session, entity) {
                    debug!(session = %session.id(), error = %e, "Discovered asset not dispatched");
                }
            }
            None => {
                debug!(session = %session.id(), asset = %entity.asset, "Asset out of scope");
            }
        }
    }
}
