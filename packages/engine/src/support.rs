//! Helpers for the TTL-gated handler protocol.
//!
//! Every handler follows the same shape:
//!
//! ```ignore
//! let since = ttl_start_time(session.config(), AssetType::Fqdn, AssetType::Fqdn, PLUGIN);
//! let found = if asset_monitored_within_ttl(session, &entity, &source, since).await {
//!     source_to_assets_within_ttl(session, name, AssetType::Fqdn, &source, since).await?
//! } else {
//!     let found = query_the_source(name).await?;
//!     mark_asset_monitored(session, &entity, &source).await?;
//!     found
//! };
//! process_assets_with_source(&event, &found, &source).await;
//! ```
//!
//! A TTL hit reads what the source reported last time straight from the
//! graph; a miss does the network work and stamps the asset so concurrent
//! and later handlers skip it until the TTL lapses.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use tracing::{debug, warn};

use crate::config::Config;
use crate::dispatch::Event;
use crate::error::StoreError;
use crate::model::{Asset, AssetType, Entity, Property, Source};
use crate::session::Session;

/// Simple property recording which source last probed an asset.
pub const LAST_MONITORED: &str = "last_monitored";

/// Start of the window in which results of `plugin` for `from` → `to` are fresh.
pub fn ttl_start_time(
    config: &Config,
    from: AssetType,
    to: AssetType,
    plugin: &str,
) -> DateTime<Utc> {
    let ttl = config.ttl_for(from.as_str(), to.as_str(), plugin);
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Whether `source` probed `entity` at or after `since`.
///
/// A store failure counts as "not monitored", so the caller does the work.
pub async fn asset_monitored_within_ttl(
    session: &Session,
    entity: &Entity,
    source: &Source,
    since: DateTime<Utc>,
) -> bool {
    match session
        .store()
        .entity_properties(entity.id, Some(since), &[LAST_MONITORED])
        .await
    {
        Ok(props) => props.iter().any(|p| p.property.value() == source.name),
        Err(e) => {
            warn!(
                session = %session.id(),
                asset = %entity.asset,
                source = %source.name,
                error = %e,
                "TTL check failed"
            );
            false
        }
    }
}

/// Stamp `entity` as probed by `source` now.
pub async fn mark_asset_monitored(
    session: &Session,
    entity: &Entity,
    source: &Source,
) -> Result<(), StoreError> {
    session
        .cache()
        .create_entity_property(
            entity.id,
            &Property::Simple {
                name: LAST_MONITORED.to_string(),
                value: source.name.clone(),
            },
        )
        .await
        .map(|_| ())
}

async fn reported_by(
    session: &Session,
    entity: &Entity,
    source: &Source,
    since: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let props = session
        .store()
        .entity_properties(entity.id, Some(since), &[source.name.as_str()])
        .await?;
    Ok(props
        .iter()
        .any(|p| matches!(&p.property, Property::Source { .. })))
}

/// Assets `source` reported for `name` within the TTL window.
///
/// For FQDNs these are the stored names at or below `name`; for other types,
/// the neighbours of the `name` node of that type.
pub async fn source_to_assets_within_ttl(
    session: &Session,
    name: &str,
    asset_type: AssetType,
    source: &Source,
    since: DateTime<Utc>,
) -> Result<Vec<Entity>, StoreError> {
    let store = session.store();

    let candidates = if asset_type == AssetType::Fqdn {
        store.find_by_scope(&[Asset::fqdn(name)], None).await?
    } else {
        let found = store.find_entity_by_content(&Asset::fqdn(name), None).await?;
        let mut neighbours = Vec::new();
        for origin in &found {
            for edge in store.outgoing_edges(origin.id, None, &[]).await? {
                let target = store.find_entity_by_id(edge.to).await?;
                if target.asset_type() == asset_type && !neighbours.contains(&target) {
                    neighbours.push(target);
                }
            }
        }
        neighbours
    };

    let mut results = Vec::new();
    for entity in candidates {
        if reported_by(session, &entity, source, since).await? {
            results.push(entity);
        }
    }

    debug!(
        session = %session.id(),
        name = %name,
        source = %source.name,
        found = results.len(),
        "Reused assets within TTL"
    );
    Ok(results)
}

/// Attach provenance to each entity and queue the in-scope ones.
///
/// Returns how many new events were queued.
pub async fn process_assets_with_source(
    event: &Event,
    entities: &[Entity],
    source: &Source,
) -> usize {
    let session = &event.session;
    let min_confidence = session.config().min_confidence;
    let provenance = source.property();
    let mut queued = 0;

    for entity in entities {
        if session
            .cache()
            .create_entity_property(entity.id, &provenance)
            .await
            .is_err()
        {
            // Already logged by the cache.
            continue;
        }

        if session
            .scope()
            .is_asset_in_scope(&entity.asset, min_confidence)
            .is_none()
        {
            continue;
        }

        match event.dispatcher.dispatch_event(session, entity.clone()) {
            Ok(true) => queued += 1,
            Ok(false) => {}
            Err(e) => debug!(
                session = %session.id(),
                asset = %entity.asset,
                error = %e,
                "Not dispatched"
            ),
        }
    }

    queued
}

/// Every stored name inside the session's root domains, sorted.
pub async fn discovered_names(
    session: &Session,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<String>, StoreError> {
    let roots = session.scope().domain_assets();
    if roots.is_empty() {
        return Ok(Vec::new());
    }

    let mut names: Vec<String> = session
        .store()
        .find_by_scope(&roots, since)
        .await?
        .into_iter()
        .filter_map(|e| e.asset.as_fqdn().map(str::to_string))
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{Relation, RR_A};
    use crate::store::InMemoryGraphStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn session() -> Session {
        let config = Config::new()
            .with_domain("example.com")
            .with_transformation("FQDN", "FQDN", Some(60));
        Session::new(Arc::new(config), Arc::new(InMemoryGraphStore::new())).unwrap()
    }

    #[test]
    fn test_ttl_start_time_is_now_minus_ttl() {
        let cfg = Config::new().with_transformation("FQDN", "all", Some(30));
        let since = ttl_start_time(&cfg, AssetType::Fqdn, AssetType::IpAddress, "DNS");
        let expected = Utc::now() - TimeDelta::minutes(30);
        assert!((since - expected).num_seconds().abs() <= 1);
    }

    #[tokio::test]
    async fn test_monitored_within_ttl_round_trip() {
        let session = session();
        let source = Source::new("LetItGo", 100);
        let entity = session.cache().create_asset(&Asset::fqdn("example.com")).await.unwrap();
        let since = ttl_start_time(session.config(), AssetType::Fqdn, AssetType::Fqdn, "LetItGo");

        assert!(!asset_monitored_within_ttl(&session, &entity, &source, since).await);
        mark_asset_monitored(&session, &entity, &source).await.unwrap();
        assert!(asset_monitored_within_ttl(&session, &entity, &source, since).await);

        // Another source's mark does not count.
        let other = Source::new("RDAP", 100);
        assert!(!asset_monitored_within_ttl(&session, &entity, &other, since).await);

        // A window starting after the mark plus the TTL sees nothing.
        let later = Utc::now() + TimeDelta::minutes(61);
        assert!(!asset_monitored_within_ttl(&session, &entity, &source, later).await);
    }

    #[tokio::test]
    async fn test_source_to_assets_reads_cached_names() {
        let session = session();
        let source = Source::new("LetItGo", 100);
        let since = Utc::now() - TimeDelta::from_std(Duration::from_secs(60)).unwrap();

        for name in ["www.example.com", "api.example.com", "www.other.org"] {
            let e = session.cache().create_asset(&Asset::fqdn(name)).await.unwrap();
            session
                .cache()
                .create_entity_property(e.id, &source.property())
                .await
                .unwrap();
        }
        session.cache().create_asset(&Asset::fqdn("dev.example.com")).await.unwrap();

        let found =
            source_to_assets_within_ttl(&session, "example.com", AssetType::Fqdn, &source, since)
                .await
                .unwrap();
        let mut names: Vec<_> = found.iter().filter_map(|e| e.asset.as_fqdn()).collect();
        names.sort();
        assert_eq!(names, vec!["api.example.com", "www.example.com"]);
    }

    #[tokio::test]
    async fn test_source_to_assets_follows_neighbours_for_other_types() {
        let session = session();
        let source = Source::new("DNS", 100);
        let since = Utc::now() - TimeDelta::minutes(5);

        let name = session.cache().create_asset(&Asset::fqdn("www.example.com")).await.unwrap();
        let ip = session
            .cache()
            .create_asset(&Asset::ip("192.0.2.8".parse().unwrap()))
            .await
            .unwrap();
        session
            .cache()
            .create_edge(&Relation::BasicDns { rr_type: RR_A }, &name, &ip)
            .await
            .unwrap();
        session
            .cache()
            .create_entity_property(ip.id, &source.property())
            .await
            .unwrap();

        let found = source_to_assets_within_ttl(
            &session,
            "www.example.com",
            AssetType::IpAddress,
            &source,
            since,
        )
        .await
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ip.id);
    }

    #[tokio::test]
    async fn test_discovered_names_stay_inside_roots() {
        let session = session();
        for name in ["www.example.com", "example.com", "partner.org"] {
            session.cache().create_asset(&Asset::fqdn(name)).await.unwrap();
        }
        let names = discovered_names(&session, None).await.unwrap();
        assert_eq!(names, vec!["example.com", "www.example.com"]);
    }
}
