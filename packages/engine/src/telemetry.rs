//! Tracing setup and per-session log streams.
//!
//! Every [`Session`](crate::session::Session) runs its handlers inside a
//! `session{id=...}` span. [`SessionLogLayer`] tags those spans and copies
//! each event emitted under one into that session's broadcast channel, so a
//! client can follow a single run's logs with
//! [`Session::subscribe_logs`](crate::session::Session::subscribe_logs).
//!
//! ```text
//! handler event ──► SessionLogLayer ──► span scope has session tag?
//!                                          │ yes
//!                                          ▼
//!                            sink for that id ──► broadcast::Receiver<SessionLogRecord>
//! ```
//!
//! Lagging subscribers lose the oldest records; emitting never blocks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Records buffered per session before slow subscribers start lagging.
pub const SESSION_LOG_CAPACITY: usize = 1024;

/// Name of the span every session's work runs in.
pub(crate) const SESSION_SPAN: &str = "session";

/// Install a global subscriber: `RUST_LOG` if set, else `default_directives`.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing(default_directives: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .with(SessionLogLayer)
        .try_init()
        .is_ok()
}

// =============================================================================
// Records and sinks
// =============================================================================

/// One log event emitted on behalf of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionLogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

type SessionSinks = DashMap<Uuid, broadcast::Sender<SessionLogRecord>>;

fn sinks() -> &'static SessionSinks {
    static SINKS: OnceLock<SessionSinks> = OnceLock::new();
    SINKS.get_or_init(DashMap::new)
}

/// Create the log channel for a session and make it routable.
pub(crate) fn open_session_sink(id: Uuid) -> broadcast::Sender<SessionLogRecord> {
    let (tx, _) = broadcast::channel(SESSION_LOG_CAPACITY);
    sinks().insert(id, tx.clone());
    tx
}

pub(crate) fn close_session_sink(id: Uuid) {
    sinks().remove(&id);
}

// =============================================================================
// Layer
// =============================================================================

/// Session id stored in the extensions of a `session` span.
struct SessionTag(Uuid);

/// Routes events inside a `session` span to that session's log channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionLogLayer;

impl<S> Layer<S> for SessionLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != SESSION_SPAN {
            return;
        }
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        let Some(session) = visitor.fields.get("id").and_then(|v| Uuid::parse_str(v).ok())
        else {
            return;
        };
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SessionTag(session));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        let Some(session) = scope
            .from_root()
            .find_map(|span| span.extensions().get::<SessionTag>().map(|tag| tag.0))
        else {
            return;
        };
        let Some(tx) = sinks().get(&session).map(|tx| tx.clone()) else {
            return;
        };
        if tx.receiver_count() == 0 {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();

        // No receivers left is fine.
        let _ = tx.send(SessionLogRecord {
            timestamp: Utc::now(),
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{:?}", value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dispatch::{Dispatcher, Event};
    use crate::model::AssetType;
    use crate::registry::{handler_fn, Handler, Registry};
    use crate::session::Session;
    use crate::store::InMemoryGraphStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;
    use tracing::{info, warn};

    fn session() -> Session {
        let config = Config::new().with_domain("example.com");
        Session::new(Arc::new(config), Arc::new(InMemoryGraphStore::new())).unwrap()
    }

    #[test]
    fn test_second_init_is_a_no_op() {
        init_tracing("info,surface_engine=debug");
        assert!(!init_tracing("info"));
    }

    #[test]
    fn test_events_in_session_span_reach_only_that_session() {
        let subscriber = tracing_subscriber::registry().with(SessionLogLayer);
        tracing::subscriber::with_default(subscriber, || {
            let first = session();
            let second = session();
            let mut logs = first.subscribe_logs();
            let mut other = second.subscribe_logs();

            info!("outside any session");
            {
                let _entered = first.span().enter();
                let _inner = tracing::info_span!("handler", name = "LetItGo").entered();
                warn!(asset = %"www.example.com", attempts = 3, "Lookup failed");
            }

            let record = logs.try_recv().unwrap();
            assert_eq!(record.level, "WARN");
            assert_eq!(record.message, "Lookup failed");
            assert_eq!(record.fields["asset"], "www.example.com");
            assert_eq!(record.fields["attempts"], "3");

            assert!(matches!(logs.try_recv(), Err(TryRecvError::Empty)));
            assert!(matches!(other.try_recv(), Err(TryRecvError::Empty)));
        });
    }

    #[test]
    fn test_dropped_session_stops_routing() {
        let subscriber = tracing_subscriber::registry().with(SessionLogLayer);
        tracing::subscriber::with_default(subscriber, || {
            let session = session();
            let id = session.id();
            let mut logs = session.subscribe_logs();
            let span = session.span().clone();
            drop(session);

            assert!(!sinks().contains_key(&id));
            let _entered = span.enter();
            info!("after the session is gone");
            assert!(matches!(logs.try_recv(), Err(TryRecvError::Closed)));
        });
    }

    #[test]
    fn test_handler_failures_are_streamed_to_the_session() {
        let subscriber = tracing_subscriber::registry().with(SessionLogLayer);
        tracing::subscriber::with_default(subscriber, || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let registry = Arc::new(Registry::new());
                registry
                    .register_handler(Handler::new(
                        "Broken",
                        "Broken-Handler",
                        AssetType::Fqdn,
                        handler_fn(|_event: Event| async {
                            Err::<(), _>(anyhow::anyhow!("upstream returned 500"))
                        }),
                    ))
                    .unwrap();

                let session = Arc::new(session());
                let mut logs = session.subscribe_logs();
                let dispatcher = Dispatcher::new(registry);
                dispatcher.attach(&session);
                dispatcher.seed(&session).await.unwrap();

                let record = tokio::time::timeout(Duration::from_secs(5), async {
                    loop {
                        let record = logs.recv().await.unwrap();
                        if record.message == "Handler failed" {
                            break record;
                        }
                    }
                })
                .await
                .unwrap();

                assert_eq!(record.level, "ERROR");
                assert_eq!(record.fields["plugin"], "Broken");
                assert!(record.fields["error"].contains("upstream returned 500"));
            });
        });
    }
}
