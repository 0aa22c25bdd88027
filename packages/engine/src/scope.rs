//! Enumeration scope.
//!
//! A [`Scope`] holds the root domains (and optional address, netblock, ASN
//! and port constraints) that define what a session may explore. Membership
//! for names is suffix based and case-insensitive: a name is in scope iff it
//! equals a root domain or ends with `"." + root`.
//!
//! Roots can be added while the run is in flight (federation responses,
//! redirects). Additions are visible to the next membership test. There is no
//! removal.

use std::net::IpAddr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexSet;
use ipnet::IpNet;

use crate::config::Config;
use crate::model::{normalize_name, Asset};

/// Confidence reported when an asset equals a root exactly.
pub const EXACT_MATCH_CONFIDENCE: u8 = 100;
/// Confidence reported for a name below a root.
pub const SUFFIX_MATCH_CONFIDENCE: u8 = 90;

/// Positive membership result: the root that matched and how strongly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeMatch {
    pub asset: Asset,
    pub confidence: u8,
}

#[derive(Debug, Default)]
struct ScopeInner {
    domains: IndexSet<String>,
    addresses: IndexSet<IpAddr>,
    cidrs: Vec<IpNet>,
    asns: IndexSet<u32>,
    ports: IndexSet<u16>,
}

/// Thread-safe set of roots and constraints for one session.
#[derive(Debug, Default)]
pub struct Scope {
    inner: RwLock<ScopeInner>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the scope from the session configuration.
    pub fn from_config(config: &Config) -> Self {
        let scope = Self::new();
        for domain in &config.domains {
            scope.add_domain(domain);
        }
        for addr in &config.addresses {
            scope.add_address(*addr);
        }
        for cidr in &config.cidrs {
            scope.add_cidr(*cidr);
        }
        for asn in &config.asns {
            scope.add_asn(*asn);
        }
        {
            let mut inner = scope.write();
            inner.ports.extend(config.ports.iter().copied());
        }
        scope
    }

    // A poisoned lock only means a writer panicked mid-insert; the sets are still valid.
    fn read(&self) -> RwLockReadGuard<'_, ScopeInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ScopeInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a root domain. Returns `true` if it was not already present.
    pub fn add_domain(&self, name: &str) -> bool {
        let name = normalize_name(name);
        if name.is_empty() {
            return false;
        }
        self.write().domains.insert(name)
    }

    pub fn add_address(&self, addr: IpAddr) -> bool {
        self.write().addresses.insert(addr)
    }

    pub fn add_cidr(&self, cidr: IpNet) -> bool {
        let cidr = cidr.trunc();
        let mut inner = self.write();
        if inner.cidrs.contains(&cidr) {
            return false;
        }
        inner.cidrs.push(cidr);
        true
    }

    pub fn add_asn(&self, asn: u32) -> bool {
        self.write().asns.insert(asn)
    }

    /// Root domains in insertion order.
    pub fn domains(&self) -> Vec<String> {
        self.read().domains.iter().cloned().collect()
    }

    pub fn ports(&self) -> Vec<u16> {
        self.read().ports.iter().copied().collect()
    }

    /// Root domains as FQDN assets, for scope queries against the store.
    pub fn domain_assets(&self) -> Vec<Asset> {
        self.read().domains.iter().map(Asset::fqdn).collect()
    }

    /// Decide whether `asset` belongs to this enumeration.
    ///
    /// Returns `None` when nothing matches or the match is weaker than
    /// `min_confidence`. Asset types the scope has no rule for never match.
    pub fn is_asset_in_scope(&self, asset: &Asset, min_confidence: u8) -> Option<ScopeMatch> {
        let found = match asset {
            Asset::Fqdn { name } => self.match_domain(name),
            Asset::IpAddress { address } => self.match_address(*address),
            Asset::Netblock { cidr } => self.match_netblock(cidr),
            Asset::AutonomousSystem { number } => self.match_asn(*number),
            _ => None,
        };
        found.filter(|m| m.confidence >= min_confidence)
    }

    fn match_domain(&self, name: &str) -> Option<ScopeMatch> {
        let name = normalize_name(name);
        let inner = self.read();

        let mut best: Option<ScopeMatch> = None;
        for root in &inner.domains {
            let confidence = if name == *root {
                EXACT_MATCH_CONFIDENCE
            } else if name.len() > root.len()
                && name.ends_with(root.as_str())
                && name.as_bytes()[name.len() - root.len() - 1] == b'.'
            {
                SUFFIX_MATCH_CONFIDENCE
            } else {
                continue;
            };

            // Prefer the stronger match, then the more specific root.
            let better = best.as_ref().map_or(true, |b| {
                confidence > b.confidence
                    || (confidence == b.confidence
                        && root.len() > b.asset.as_fqdn().map_or(0, str::len))
            });
            if better {
                best = Some(ScopeMatch {
                    asset: Asset::fqdn(root.clone()),
                    confidence,
                });
            }
        }
        best
    }

    fn match_address(&self, addr: IpAddr) -> Option<ScopeMatch> {
        let inner = self.read();
        if inner.addresses.contains(&addr) {
            return Some(ScopeMatch {
                asset: Asset::ip(addr),
                confidence: EXACT_MATCH_CONFIDENCE,
            });
        }
        inner
            .cidrs
            .iter()
            .filter(|cidr| cidr.contains(&addr))
            .max_by_key(|cidr| cidr.prefix_len())
            .map(|cidr| ScopeMatch {
                asset: Asset::netblock(*cidr),
                confidence: EXACT_MATCH_CONFIDENCE,
            })
    }

    fn match_netblock(&self, block: &IpNet) -> Option<ScopeMatch> {
        let block = block.trunc();
        let inner = self.read();
        inner
            .cidrs
            .iter()
            .filter(|cidr| cidr.contains(&block))
            .max_by_key(|cidr| cidr.prefix_len())
            .map(|cidr| ScopeMatch {
                asset: Asset::netblock(*cidr),
                confidence: if *cidr == block {
                    EXACT_MATCH_CONFIDENCE
                } else {
                    SUFFIX_MATCH_CONFIDENCE
                },
            })
    }

    fn match_asn(&self, asn: u32) -> Option<ScopeMatch> {
        self.read().asns.contains(&asn).then(|| ScopeMatch {
            asset: Asset::autonomous_system(asn),
            confidence: EXACT_MATCH_CONFIDENCE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn scope_with(domains: &[&str]) -> Scope {
        let scope = Scope::new();
        for d in domains {
            scope.add_domain(d);
        }
        scope
    }

    #[test]
    fn test_suffix_membership_is_case_insensitive() {
        let scope = scope_with(&["example.com"]);

        let exact = scope.is_asset_in_scope(&Asset::fqdn("EXAMPLE.com"), 0).unwrap();
        assert_eq!(exact.confidence, EXACT_MATCH_CONFIDENCE);
        assert_eq!(exact.asset, Asset::fqdn("example.com"));

        let sub = scope.is_asset_in_scope(&Asset::fqdn("api.example.com"), 0).unwrap();
        assert!(sub.confidence > 0 && sub.confidence < EXACT_MATCH_CONFIDENCE);

        assert!(scope.is_asset_in_scope(&Asset::fqdn("notexample.com"), 0).is_none());
        assert!(scope.is_asset_in_scope(&Asset::fqdn("example.com.evil.net"), 0).is_none());
    }

    #[test]
    fn test_add_domain_is_idempotent() {
        let scope = Scope::new();
        assert!(scope.add_domain("example.com"));
        assert!(!scope.add_domain("Example.COM."));
        assert_eq!(scope.domains(), vec!["example.com".to_string()]);
        assert!(scope.is_asset_in_scope(&Asset::fqdn("www.example.com"), 0).is_some());
    }

    #[test]
    fn test_min_confidence_filters_suffix_matches() {
        let scope = scope_with(&["example.com"]);
        assert!(scope
            .is_asset_in_scope(&Asset::fqdn("www.example.com"), EXACT_MATCH_CONFIDENCE)
            .is_none());
        assert!(scope
            .is_asset_in_scope(&Asset::fqdn("example.com"), EXACT_MATCH_CONFIDENCE)
            .is_some());
    }

    #[test]
    fn test_most_specific_root_wins() {
        let scope = scope_with(&["example.com", "dev.example.com"]);
        let m = scope.is_asset_in_scope(&Asset::fqdn("api.dev.example.com"), 0).unwrap();
        assert_eq!(m.asset, Asset::fqdn("dev.example.com"));
    }

    #[test]
    fn test_addresses_match_by_cidr() {
        let scope = Scope::new();
        scope.add_cidr("198.51.100.0/24".parse().unwrap());
        scope.add_cidr("198.51.0.0/16".parse().unwrap());

        let m = scope
            .is_asset_in_scope(&Asset::ip("198.51.100.7".parse().unwrap()), 0)
            .unwrap();
        assert_eq!(m.asset, Asset::netblock("198.51.100.0/24".parse().unwrap()));
        assert!(scope
            .is_asset_in_scope(&Asset::ip("203.0.113.1".parse().unwrap()), 0)
            .is_none());
    }

    #[test]
    fn test_unscoped_asset_types_never_match() {
        let scope = scope_with(&["example.com"]);
        let email = Asset::EmailAddress {
            address: "admin@example.com".into(),
        };
        assert!(scope.is_asset_in_scope(&email, 0).is_none());
    }

    #[test]
    fn test_concurrent_adds_and_reads() {
        let scope = Arc::new(Scope::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let scope = scope.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        scope.add_domain(&format!("d{}-{}.example", i, j % 10));
                        let _ = scope.is_asset_in_scope(&Asset::fqdn("x.d0-0.example"), 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(scope.domains().len(), 80);
    }

    proptest! {
        #[test]
        fn prop_membership_iff_equal_or_dot_suffix(
            label in "[a-z]{1,8}",
            root in "[a-z]{1,8}\\.(com|net|org)",
            upper in any::<bool>(),
        ) {
            let scope = scope_with(&[root.as_str()]);
            let sub = format!("{label}.{root}");
            let glued = format!("{label}{root}");
            let probe = if upper { sub.to_ascii_uppercase() } else { sub.clone() };

            prop_assert!(scope.is_asset_in_scope(&Asset::fqdn(probe), 0).is_some());
            let upper_root = Asset::fqdn(root.to_ascii_uppercase());
            prop_assert!(scope.is_asset_in_scope(&upper_root, 0).is_some());
            prop_assert!(scope.is_asset_in_scope(&Asset::fqdn(glued), 0).is_none());
        }
    }
}
