//! Address → autonomous system lookup.
//!
//! [`AsnCache`] maps announced prefixes to the AS that announces them. It is
//! a binary trie per address family, so a lookup costs at most one step per
//! prefix bit no matter how many netblocks are loaded.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Serialize;

use crate::error::StoreError;
use crate::model::{Asset, AssetType, ANNOUNCES, REGISTRATION};
use crate::store::GraphStore;
use crate::traversal::NameAddrPair;

/// One announced prefix and who announces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AsnEntry {
    pub asn: u32,
    pub description: String,
    pub prefix: IpNet,
}

#[derive(Debug, Clone, Default)]
struct Node {
    children: [Option<usize>; 2],
    entry: Option<usize>,
}

#[derive(Debug)]
struct Trie {
    nodes: Vec<Node>,
}

impl Default for Trie {
    fn default() -> Self {
        Self {
            nodes: vec![Node::default()],
        }
    }
}

// Left-aligned address bits so both families walk from bit 0.
fn address_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => (u32::from(v4) as u128) << 96,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn bit(bits: u128, i: u8) -> usize {
    ((bits >> (127 - i as u32)) & 1) as usize
}

impl Trie {
    fn insert(&mut self, bits: u128, len: u8, entry: usize) -> Option<usize> {
        let mut idx = 0;
        for i in 0..len {
            let b = bit(bits, i);
            idx = match self.nodes[idx].children[b] {
                Some(child) => child,
                None => {
                    self.nodes.push(Node::default());
                    let child = self.nodes.len() - 1;
                    self.nodes[idx].children[b] = Some(child);
                    child
                }
            };
        }
        self.nodes[idx].entry.replace(entry)
    }

    fn longest_match(&self, bits: u128, max_len: u8) -> Option<usize> {
        let mut idx = 0;
        let mut best = self.nodes[0].entry;
        for i in 0..max_len {
            match self.nodes[idx].children[bit(bits, i)] {
                Some(child) => {
                    idx = child;
                    if let Some(e) = self.nodes[idx].entry {
                        best = Some(e);
                    }
                }
                None => break,
            }
        }
        best
    }
}

/// Longest-prefix-match table of announced netblocks.
#[derive(Debug, Default)]
pub struct AsnCache {
    v4: Trie,
    v6: Trie,
    entries: Vec<AsnEntry>,
}

impl AsnCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a prefix. A second insert of the same prefix replaces the first.
    pub fn insert(&mut self, entry: AsnEntry) {
        let prefix = entry.prefix.trunc();
        let (trie, bits) = match prefix {
            IpNet::V4(net) => (&mut self.v4, address_bits(IpAddr::V4(net.network()))),
            IpNet::V6(net) => (&mut self.v6, address_bits(IpAddr::V6(net.network()))),
        };

        let slot = self.entries.len();
        match trie.insert(bits, prefix.prefix_len(), slot) {
            Some(existing) => {
                // Keep the original slot; the trie still points at it.
                trie.insert(bits, prefix.prefix_len(), existing);
                self.entries[existing] = AsnEntry { prefix, ..entry };
            }
            None => self.entries.push(AsnEntry { prefix, ..entry }),
        }
    }

    /// Most specific announced prefix containing `addr`.
    pub fn lookup(&self, addr: IpAddr) -> Option<&AsnEntry> {
        let (trie, max_len) = match addr {
            IpAddr::V4(_) => (&self.v4, 32),
            IpAddr::V6(_) => (&self.v6, 128),
        };
        trie.longest_match(address_bits(addr), max_len)
            .map(|i| &self.entries[i])
    }

    /// Number of distinct prefixes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build the table from every stored AS and the netblocks it announces.
    pub async fn load(
        store: &dyn GraphStore,
        since: Option<DateTime<Utc>>,
    ) -> Result<Self, StoreError> {
        let mut cache = Self::new();

        for as_entity in store
            .find_entities_by_type(AssetType::AutonomousSystem, since)
            .await?
        {
            let Asset::AutonomousSystem { number } = as_entity.asset else {
                continue;
            };

            let mut description = String::new();
            for edge in store
                .outgoing_edges(as_entity.id, since, &[REGISTRATION])
                .await?
            {
                let record = store.find_entity_by_id(edge.to).await?;
                if let Asset::AutnumRecord { name, .. } = record.asset {
                    description = name;
                    break;
                }
            }

            for edge in store.outgoing_edges(as_entity.id, since, &[ANNOUNCES]).await? {
                if let Asset::Netblock { cidr } = store.find_entity_by_id(edge.to).await?.asset {
                    cache.insert(AsnEntry {
                        asn: number,
                        description: description.clone(),
                        prefix: cidr,
                    });
                }
            }
        }

        Ok(cache)
    }
}

// =============================================================================
// Summaries
// =============================================================================

/// Per-AS view of a set of resolved names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AsnReport {
    pub asn: u32,
    pub description: String,
    pub names: BTreeSet<String>,
    /// Distinct addresses seen in each announced netblock.
    pub netblocks: BTreeMap<IpNet, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AsnSummary {
    pub reports: BTreeMap<u32, AsnReport>,
    /// Addresses no loaded prefix covers.
    pub unmapped: usize,
}

/// Group resolved name/address pairs by the AS announcing each address.
pub fn summarize(pairs: &[NameAddrPair], cache: &AsnCache) -> AsnSummary {
    let mut summary = AsnSummary::default();
    let mut seen: HashSet<IpAddr> = HashSet::new();
    let mut unmapped: HashSet<IpAddr> = HashSet::new();

    for pair in pairs {
        let Some(entry) = cache.lookup(pair.address) else {
            unmapped.insert(pair.address);
            continue;
        };

        let report = summary
            .reports
            .entry(entry.asn)
            .or_insert_with(|| AsnReport {
                asn: entry.asn,
                description: entry.description.clone(),
                ..Default::default()
            });
        report.names.insert(pair.name.clone());
        if seen.insert(pair.address) {
            *report.netblocks.entry(entry.prefix).or_insert(0) += 1;
        }
    }

    summary.unmapped = unmapped.len();
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Relation;
    use crate::store::InMemoryGraphStore;

    fn entry(asn: u32, prefix: &str) -> AsnEntry {
        AsnEntry {
            asn,
            description: format!("AS{}", asn),
            prefix: prefix.parse().unwrap(),
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut cache = AsnCache::new();
        cache.insert(entry(64496, "198.51.0.0/16"));
        cache.insert(entry(64497, "198.51.100.0/24"));
        cache.insert(entry(64498, "2001:db8::/32"));

        let hit = cache.lookup("198.51.100.9".parse().unwrap()).unwrap();
        assert_eq!(hit.asn, 64497);
        let hit = cache.lookup("198.51.7.1".parse().unwrap()).unwrap();
        assert_eq!(hit.asn, 64496);
        let hit = cache.lookup("2001:db8::53".parse().unwrap()).unwrap();
        assert_eq!(hit.asn, 64498);
        assert!(cache.lookup("203.0.113.1".parse().unwrap()).is_none());
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_reinsert_replaces_entry() {
        let mut cache = AsnCache::new();
        cache.insert(entry(64496, "192.0.2.0/24"));
        cache.insert(entry(64511, "192.0.2.77/24"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup("192.0.2.1".parse().unwrap()).unwrap().asn, 64511);
    }

    #[test]
    fn test_many_prefixes() {
        let mut cache = AsnCache::new();
        for i in 0..=255u32 {
            for j in (0..=255u32).step_by(16) {
                cache.insert(entry(
                    65000 + i,
                    &format!("10.{}.{}.0/24", i, j),
                ));
            }
        }
        assert_eq!(cache.len(), 256 * 16);
        assert_eq!(cache.lookup("10.200.32.5".parse().unwrap()).unwrap().asn, 65200);
        assert!(cache.lookup("10.200.33.5".parse().unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_load_reads_announcements_and_registration() {
        let store = InMemoryGraphStore::new();
        let asn = store
            .create_entity(&Asset::autonomous_system(64496))
            .await
            .unwrap()
            .record;
        let nb = store
            .create_entity(&Asset::netblock("192.0.2.0/24".parse().unwrap()))
            .await
            .unwrap()
            .record;
        let reg = store
            .create_entity(&Asset::AutnumRecord {
                handle: "AS64496".into(),
                number: 64496,
                name: "EXAMPLE-NET".into(),
            })
            .await
            .unwrap()
            .record;
        store
            .create_edge(&Relation::simple(ANNOUNCES), asn.id, nb.id)
            .await
            .unwrap();
        store
            .create_edge(&Relation::simple(REGISTRATION), asn.id, reg.id)
            .await
            .unwrap();

        let cache = AsnCache::load(&store, None).await.unwrap();
        let hit = cache.lookup("192.0.2.200".parse().unwrap()).unwrap();
        assert_eq!(hit.asn, 64496);
        assert_eq!(hit.description, "EXAMPLE-NET");
    }

    #[test]
    fn test_summarize_groups_by_asn() {
        let mut cache = AsnCache::new();
        cache.insert(entry(64496, "192.0.2.0/24"));

        let pair = |name: &str, addr: &str| NameAddrPair {
            name: name.into(),
            address: addr.parse().unwrap(),
        };
        let pairs = vec![
            pair("www.example.com", "192.0.2.1"),
            pair("api.example.com", "192.0.2.1"),
            pair("mail.example.com", "192.0.2.25"),
            pair("elsewhere.example.com", "203.0.113.9"),
        ];

        let summary = summarize(&pairs, &cache);
        let report = &summary.reports[&64496];
        assert_eq!(report.names.len(), 3);
        assert_eq!(report.netblocks[&"192.0.2.0/24".parse::<IpNet>().unwrap()], 2);
        assert_eq!(summary.unmapped, 1);
    }
}
