//! Bounded walks over DNS and routing relationships in the asset graph.
//!
//! The graph is built from attacker-influenced data, so every walk here is
//! bounded: alias chains stop after [`MAX_ALIAS_HOPS`] hops and abort the
//! moment a node repeats. Running out of hops or hitting a cycle is reported
//! as a [`TraversalError`], never as a hang.

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{StoreError, TraversalError};
use crate::model::{
    Asset, Edge, Entity, Relation, ANNOUNCES, DNS_RECORD, RR_A, RR_AAAA, RR_CNAME, RR_MX, RR_NS,
    RR_SRV,
};
use crate::store::GraphStore;

/// Longest alias (CNAME) chain followed before giving up.
pub const MAX_ALIAS_HOPS: usize = 10;

/// A name and one address it resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct NameAddrPair {
    pub name: String,
    pub address: IpAddr,
}

type Since = Option<DateTime<Utc>>;

fn is_address_record(edge: &Edge) -> bool {
    matches!(edge.relation, Relation::BasicDns { rr_type } if rr_type == RR_A || rr_type == RR_AAAA)
}

fn is_alias_record(edge: &Edge) -> bool {
    matches!(edge.relation, Relation::BasicDns { rr_type } if rr_type == RR_CNAME)
}

/// NS and MX (preference records) and SRV need one more hop to an address.
fn is_indirect_record(edge: &Edge) -> bool {
    match edge.relation {
        Relation::PrefDns { rr_type, .. } => rr_type == RR_NS || rr_type == RR_MX,
        Relation::SrvDns { rr_type, .. } => rr_type == RR_SRV,
        _ => false,
    }
}

async fn addresses_of(
    store: &dyn GraphStore,
    edges: &[Edge],
) -> Result<Vec<IpAddr>, StoreError> {
    let mut addrs = Vec::new();
    for edge in edges.iter().filter(|e| is_address_record(e)) {
        if let Some(ip) = store.find_entity_by_id(edge.to).await?.asset.as_ip() {
            if !addrs.contains(&ip) {
                addrs.push(ip);
            }
        }
    }
    Ok(addrs)
}

/// Resolve every stored name to its addresses.
///
/// Names missing from the store, or whose walk fails, are skipped; only
/// store failures and cancellation abort the whole call.
pub async fn names_to_addrs(
    store: &dyn GraphStore,
    since: Since,
    names: &[&str],
    cancel: &CancellationToken,
) -> Result<Vec<NameAddrPair>, TraversalError> {
    let mut pairs = Vec::new();

    for name in names {
        if cancel.is_cancelled() {
            return Err(TraversalError::Cancelled);
        }

        let found = store.find_entity_by_content(&Asset::fqdn(*name), since).await?;
        let [entity] = found.as_slice() else {
            continue;
        };

        match resolve_name(store, entity, since, cancel).await {
            Ok(addrs) => {
                let name = entity.key().value;
                pairs.extend(addrs.into_iter().map(|address| NameAddrPair {
                    name: name.clone(),
                    address,
                }));
            }
            Err(e @ (TraversalError::Store(_) | TraversalError::Cancelled)) => return Err(e),
            Err(e) => debug!(name = %name, reason = %e, "Name did not resolve"),
        }
    }

    Ok(pairs)
}

/// Addresses reachable from one FQDN entity.
///
/// Direct A/AAAA records win; otherwise the alias chain is followed, then
/// NS, MX and SRV targets are tried one hop deep.
pub async fn resolve_name(
    store: &dyn GraphStore,
    entity: &Entity,
    since: Since,
    cancel: &CancellationToken,
) -> Result<Vec<IpAddr>, TraversalError> {
    let edges = store.outgoing_edges(entity.id, since, &[DNS_RECORD]).await?;

    let direct = addresses_of(store, &edges).await?;
    if !direct.is_empty() {
        return Ok(direct);
    }

    let mut last_err = None;
    for edge in edges.iter().filter(|e| is_alias_record(e)) {
        match resolve_alias_chain(store, entity, edge, since, cancel).await {
            Ok(addrs) => return Ok(addrs),
            Err(e @ (TraversalError::Store(_) | TraversalError::Cancelled)) => return Err(e),
            Err(e) => last_err = Some(e),
        }
    }

    for edge in edges.iter().filter(|e| is_indirect_record(e)) {
        let target = store.find_entity_by_id(edge.to).await?;
        let addrs = one_more_name(store, &target, since).await?;
        if !addrs.is_empty() {
            return Ok(addrs);
        }
    }

    Err(last_err.unwrap_or_else(|| TraversalError::NoAddress {
        name: entity.key().value,
    }))
}

/// Follow CNAME records from `origin` through `first` until an address record.
pub async fn resolve_alias_chain(
    store: &dyn GraphStore,
    origin: &Entity,
    first: &Edge,
    since: Since,
    cancel: &CancellationToken,
) -> Result<Vec<IpAddr>, TraversalError> {
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(origin.key().to_string());

    let mut next = first.to;
    for _ in 0..MAX_ALIAS_HOPS {
        if cancel.is_cancelled() {
            return Err(TraversalError::Cancelled);
        }

        let node = store.find_entity_by_id(next).await?;
        let key = node.key().to_string();
        if !visited.insert(key.clone()) {
            return Err(TraversalError::Cycle { key });
        }

        let edges = store.outgoing_edges(node.id, since, &[DNS_RECORD]).await?;
        let addrs = addresses_of(store, &edges).await?;
        if !addrs.is_empty() {
            return Ok(addrs);
        }

        match edges.iter().find(|e| is_alias_record(e)) {
            Some(alias) => next = alias.to,
            None => {
                return Err(TraversalError::NoAddress {
                    name: node.key().value,
                })
            }
        }
    }

    Err(TraversalError::HopLimit {
        hops: MAX_ALIAS_HOPS,
    })
}

/// Addresses of a name server, mail exchanger or service target.
pub async fn one_more_name(
    store: &dyn GraphStore,
    target: &Entity,
    since: Since,
) -> Result<Vec<IpAddr>, StoreError> {
    let edges = store.outgoing_edges(target.id, since, &[DNS_RECORD]).await?;
    addresses_of(store, &edges).await
}

/// Netblocks announced by an autonomous system.
///
/// Returns nothing unless exactly one stored node matches the AS number.
pub async fn read_as_prefixes(
    store: &dyn GraphStore,
    asn: u32,
    since: Since,
) -> Result<Vec<IpNet>, StoreError> {
    let found = store
        .find_by_content(&Asset::autonomous_system(asn), since)
        .await?;
    let [as_entity] = found.as_slice() else {
        return Ok(Vec::new());
    };

    let mut prefixes = Vec::new();
    for edge in store.outgoing_edges(as_entity.id, since, &[ANNOUNCES]).await? {
        if let Asset::Netblock { cidr } = store.find_entity_by_id(edge.to).await?.asset {
            prefixes.push(cidr);
        }
    }
    Ok(prefixes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGraphStore;

    struct Graph {
        store: InMemoryGraphStore,
    }

    impl Graph {
        fn new() -> Self {
            Self {
                store: InMemoryGraphStore::new(),
            }
        }

        async fn node(&self, asset: Asset) -> Entity {
            self.store.create_entity(&asset).await.unwrap().record
        }

        async fn name(&self, name: &str) -> Entity {
            self.node(Asset::fqdn(name)).await
        }

        async fn ip(&self, addr: &str) -> Entity {
            self.node(Asset::ip(addr.parse().unwrap())).await
        }

        async fn link(&self, relation: Relation, from: &Entity, to: &Entity) {
            self.store.create_edge(&relation, from.id, to.id).await.unwrap();
        }
    }

    fn a() -> Relation {
        Relation::BasicDns { rr_type: RR_A }
    }

    fn cname() -> Relation {
        Relation::BasicDns { rr_type: RR_CNAME }
    }

    #[tokio::test]
    async fn test_direct_address_records() {
        let g = Graph::new();
        let www = g.name("www.example.com").await;
        let v4 = g.ip("192.0.2.1").await;
        let v6 = g.ip("2001:db8::1").await;
        g.link(a(), &www, &v4).await;
        g.link(Relation::BasicDns { rr_type: RR_AAAA }, &www, &v6).await;

        let pairs = names_to_addrs(&g.store, None, &["www.example.com"], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|p| p.name == "www.example.com"));
    }

    #[tokio::test]
    async fn test_alias_chain_reaches_address() {
        let g = Graph::new();
        let www = g.name("www.example.com").await;
        let edge = g.name("edge.cdn.net").await;
        let origin = g.name("origin.cdn.net").await;
        let ip = g.ip("198.51.100.4").await;
        g.link(cname(), &www, &edge).await;
        g.link(cname(), &edge, &origin).await;
        g.link(a(), &origin, &ip).await;

        let pairs = names_to_addrs(&g.store, None, &["www.example.com"], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            pairs,
            vec![NameAddrPair {
                name: "www.example.com".into(),
                address: "198.51.100.4".parse().unwrap(),
            }]
        );
    }

    #[tokio::test]
    async fn test_alias_cycle_terminates_with_failure() {
        let g = Graph::new();
        let na = g.name("a.example.com").await;
        let nb = g.name("b.example.com").await;
        g.link(cname(), &na, &nb).await;
        g.link(cname(), &nb, &na).await;

        let err = resolve_name(&g.store, &na, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TraversalError::Cycle { .. }));

        let pairs = names_to_addrs(&g.store, None, &["a.example.com"], &CancellationToken::new())
            .await
            .unwrap();
        assert!(pairs.is_empty());
    }

    #[tokio::test]
    async fn test_long_alias_chain_hits_hop_limit() {
        let g = Graph::new();
        let mut prev = g.name("n0.example.com").await;
        let start = prev.clone();
        for i in 1..=MAX_ALIAS_HOPS + 2 {
            let next = g.name(&format!("n{}.example.com", i)).await;
            g.link(cname(), &prev, &next).await;
            prev = next;
        }

        let err = resolve_name(&g.store, &start, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TraversalError::HopLimit { hops } if hops == MAX_ALIAS_HOPS));
    }

    #[tokio::test]
    async fn test_mx_and_srv_take_one_more_hop() {
        let g = Graph::new();
        let apex = g.name("example.com").await;
        let mx = g.name("mail.example.com").await;
        let ip = g.ip("192.0.2.25").await;
        g.link(
            Relation::PrefDns {
                rr_type: RR_MX,
                preference: 10,
            },
            &apex,
            &mx,
        )
        .await;
        g.link(a(), &mx, &ip).await;

        let svc = g.name("_sip._tcp.example.com").await;
        let target = g.name("sip.example.com").await;
        let sip_ip = g.ip("192.0.2.50").await;
        g.link(
            Relation::SrvDns {
                rr_type: RR_SRV,
                priority: 0,
                weight: 5,
                port: 5060,
            },
            &svc,
            &target,
        )
        .await;
        g.link(a(), &target, &sip_ip).await;

        let pairs = names_to_addrs(
            &g.store,
            None,
            &["example.com", "_sip._tcp.example.com", "missing.example.com"],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].address, "192.0.2.25".parse::<IpAddr>().unwrap());
        assert_eq!(pairs[1].address, "192.0.2.50".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_walk_stops() {
        let g = Graph::new();
        g.name("www.example.com").await;
        let token = CancellationToken::new();
        token.cancel();
        let err = names_to_addrs(&g.store, None, &["www.example.com"], &token)
            .await
            .unwrap_err();
        assert!(matches!(err, TraversalError::Cancelled));
    }

    #[tokio::test]
    async fn test_read_as_prefixes_follows_announces() {
        let g = Graph::new();
        let asn = g.node(Asset::autonomous_system(64496)).await;
        let nb1 = g.node(Asset::netblock("192.0.2.0/24".parse().unwrap())).await;
        let nb2 = g.node(Asset::netblock("2001:db8::/32".parse().unwrap())).await;
        g.link(Relation::simple(ANNOUNCES), &asn, &nb1).await;
        g.link(Relation::simple(ANNOUNCES), &asn, &nb2).await;

        let mut prefixes = read_as_prefixes(&g.store, 64496, None).await.unwrap();
        prefixes.sort();
        assert_eq!(prefixes.len(), 2);
        assert!(read_as_prefixes(&g.store, 64511, None).await.unwrap().is_empty());
    }
}
