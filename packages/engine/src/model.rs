//! Asset graph data model.
//!
//! Assets are typed nodes identified by a [`ContentKey`]: two assets with the
//! same key are the same node. Edges are typed, directed relations between
//! stored entities, and both may carry [`Property`] records (provenance,
//! monitoring marks) that accumulate over time.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// DNS record types
// =============================================================================

pub const RR_A: u16 = 1;
pub const RR_NS: u16 = 2;
pub const RR_CNAME: u16 = 5;
pub const RR_MX: u16 = 15;
pub const RR_AAAA: u16 = 28;
pub const RR_SRV: u16 = 33;

/// Edge label shared by every DNS relation.
pub const DNS_RECORD: &str = "dns_record";
/// Edge label from an autonomous system to a netblock it announces.
pub const ANNOUNCES: &str = "announces";
/// Edge label from an autonomous system to its registration record.
pub const REGISTRATION: &str = "registration";

// =============================================================================
// Asset types
// =============================================================================

/// Closed set of asset kinds the engine routes events for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AssetType {
    #[serde(rename = "FQDN")]
    Fqdn,
    #[serde(rename = "IPAddress")]
    IpAddress,
    AutonomousSystem,
    Netblock,
    AutnumRecord,
    #[serde(rename = "IPNetRecord")]
    IpNetRecord,
    ContactRecord,
    Organization,
    Person,
    Location,
    EmailAddress,
    Phone,
    #[serde(rename = "URL")]
    Url,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Fqdn => "FQDN",
            AssetType::IpAddress => "IPAddress",
            AssetType::AutonomousSystem => "AutonomousSystem",
            AssetType::Netblock => "Netblock",
            AssetType::AutnumRecord => "AutnumRecord",
            AssetType::IpNetRecord => "IPNetRecord",
            AssetType::ContactRecord => "ContactRecord",
            AssetType::Organization => "Organization",
            AssetType::Person => "Person",
            AssetType::Location => "Location",
            AssetType::EmailAddress => "EmailAddress",
            AssetType::Phone => "Phone",
            AssetType::Url => "URL",
        }
    }

    /// Parse the string form, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        const ALL: [AssetType; 13] = [
            AssetType::Fqdn,
            AssetType::IpAddress,
            AssetType::AutonomousSystem,
            AssetType::Netblock,
            AssetType::AutnumRecord,
            AssetType::IpNetRecord,
            AssetType::ContactRecord,
            AssetType::Organization,
            AssetType::Person,
            AssetType::Location,
            AssetType::EmailAddress,
            AssetType::Phone,
            AssetType::Url,
        ];
        ALL.into_iter().find(|t| t.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Assets
// =============================================================================

/// A typed asset and its canonical content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Asset {
    Fqdn { name: String },
    IpAddress { address: IpAddr },
    AutonomousSystem { number: u32 },
    Netblock { cidr: IpNet },
    AutnumRecord { handle: String, number: u32, name: String },
    IpNetRecord { handle: String, cidr: IpNet },
    ContactRecord { discovered_at: String },
    Organization { name: String },
    Person { full_name: String },
    Location { address: String },
    EmailAddress { address: String },
    Phone { number: String },
    Url { raw: String },
}

impl Asset {
    pub fn fqdn(name: impl Into<String>) -> Self {
        Asset::Fqdn { name: name.into() }
    }

    pub fn ip(address: IpAddr) -> Self {
        Asset::IpAddress { address }
    }

    pub fn autonomous_system(number: u32) -> Self {
        Asset::AutonomousSystem { number }
    }

    pub fn netblock(cidr: IpNet) -> Self {
        Asset::Netblock { cidr }
    }

    pub fn asset_type(&self) -> AssetType {
        match self {
            Asset::Fqdn { .. } => AssetType::Fqdn,
            Asset::IpAddress { .. } => AssetType::IpAddress,
            Asset::AutonomousSystem { .. } => AssetType::AutonomousSystem,
            Asset::Netblock { .. } => AssetType::Netblock,
            Asset::AutnumRecord { .. } => AssetType::AutnumRecord,
            Asset::IpNetRecord { .. } => AssetType::IpNetRecord,
            Asset::ContactRecord { .. } => AssetType::ContactRecord,
            Asset::Organization { .. } => AssetType::Organization,
            Asset::Person { .. } => AssetType::Person,
            Asset::Location { .. } => AssetType::Location,
            Asset::EmailAddress { .. } => AssetType::EmailAddress,
            Asset::Phone { .. } => AssetType::Phone,
            Asset::Url { .. } => AssetType::Url,
        }
    }

    /// Content key identifying the graph node for this asset.
    pub fn key(&self) -> ContentKey {
        let value = match self {
            Asset::Fqdn { name } => normalize_name(name),
            Asset::IpAddress { address } => address.to_string(),
            Asset::AutonomousSystem { number } => number.to_string(),
            Asset::Netblock { cidr } => cidr.trunc().to_string(),
            Asset::AutnumRecord { handle, .. } => handle.trim().to_ascii_uppercase(),
            Asset::IpNetRecord { handle, .. } => handle.trim().to_ascii_uppercase(),
            Asset::ContactRecord { discovered_at } => discovered_at.trim().to_string(),
            Asset::Organization { name } => name.trim().to_string(),
            Asset::Person { full_name } => full_name.trim().to_string(),
            Asset::Location { address } => address.trim().to_string(),
            Asset::EmailAddress { address } => address.trim().to_ascii_lowercase(),
            Asset::Phone { number } => number.trim().to_string(),
            Asset::Url { raw } => raw.trim().to_string(),
        };
        ContentKey {
            asset_type: self.asset_type(),
            value,
        }
    }

    /// Canonical copy of the asset, matching its content key.
    pub fn normalized(&self) -> Asset {
        match self {
            Asset::Fqdn { name } => Asset::Fqdn {
                name: normalize_name(name),
            },
            Asset::Netblock { cidr } => Asset::Netblock { cidr: cidr.trunc() },
            Asset::EmailAddress { address } => Asset::EmailAddress {
                address: address.trim().to_ascii_lowercase(),
            },
            other => other.clone(),
        }
    }

    pub fn as_fqdn(&self) -> Option<&str> {
        match self {
            Asset::Fqdn { name } => Some(name),
            _ => None,
        }
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            Asset::IpAddress { address } => Some(*address),
            _ => None,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self.key();
        write!(f, "{}: {}", key.asset_type, key.value)
    }
}

/// Lower-cases a DNS name and strips surrounding whitespace and the root dot.
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Type plus canonical value. Equal keys mean the same graph node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentKey {
    pub asset_type: AssetType,
    pub value: String,
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.asset_type, self.value)
    }
}

// =============================================================================
// Entities and edges
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        EntityId(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(pub Uuid);

impl EdgeId {
    pub fn new() -> Self {
        EdgeId(Uuid::new_v4())
    }
}

impl Default for EdgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A stored graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub asset: Asset,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Entity {
    pub fn key(&self) -> ContentKey {
        self.asset.key()
    }

    pub fn asset_type(&self) -> AssetType {
        self.asset.asset_type()
    }
}

/// Typed relation metadata carried by an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Relation {
    Simple { name: String },
    BasicDns { rr_type: u16 },
    PrefDns { rr_type: u16, preference: u16 },
    SrvDns { rr_type: u16, priority: u16, weight: u16, port: u16 },
}

impl Relation {
    pub fn simple(name: impl Into<String>) -> Self {
        Relation::Simple { name: name.into() }
    }

    /// Edge label used by store queries.
    pub fn label(&self) -> &str {
        match self {
            Relation::Simple { name } => name,
            Relation::BasicDns { .. } | Relation::PrefDns { .. } | Relation::SrvDns { .. } => {
                DNS_RECORD
            }
        }
    }

    /// DNS record type, if this is a DNS relation.
    pub fn rr_type(&self) -> Option<u16> {
        match self {
            Relation::Simple { .. } => None,
            Relation::BasicDns { rr_type }
            | Relation::PrefDns { rr_type, .. }
            | Relation::SrvDns { rr_type, .. } => Some(*rr_type),
        }
    }

    /// Identity of the relation for edge idempotency.
    pub fn key(&self) -> String {
        match self {
            Relation::Simple { name } => name.clone(),
            Relation::BasicDns { rr_type } => format!("{DNS_RECORD}:{rr_type}"),
            Relation::PrefDns { rr_type, preference } => {
                format!("{DNS_RECORD}:{rr_type}:{preference}")
            }
            Relation::SrvDns {
                rr_type,
                priority,
                weight,
                port,
            } => format!("{DNS_RECORD}:{rr_type}:{priority}:{weight}:{port}"),
        }
    }
}

/// A stored, directed edge between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub relation: Relation,
    pub from: EntityId,
    pub to: EntityId,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

// =============================================================================
// Properties
// =============================================================================

/// Metadata attached to an entity or edge after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Property {
    /// Provenance: which source produced the finding and how sure it is.
    Source { source: String, confidence: u8 },
    Simple { name: String, value: String },
}

impl Property {
    /// Property name used for lookups. Source properties are named after their source.
    pub fn name(&self) -> &str {
        match self {
            Property::Source { source, .. } => source,
            Property::Simple { name, .. } => name,
        }
    }

    pub fn value(&self) -> String {
        match self {
            Property::Source { confidence, .. } => confidence.to_string(),
            Property::Simple { value, .. } => value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProperty {
    pub id: Uuid,
    pub entity_id: EntityId,
    pub property: Property,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeProperty {
    pub id: Uuid,
    pub edge_id: EdgeId,
    pub property: Property,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Identity of a data source: the plugin name and its confidence in its findings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub confidence: u8,
}

impl Source {
    pub fn new(name: impl Into<String>, confidence: u8) -> Self {
        Self {
            name: name.into(),
            confidence: confidence.min(100),
        }
    }

    pub fn property(&self) -> Property {
        Property::Source {
            source: self.name.clone(),
            confidence: self.confidence,
        }
    }
}
