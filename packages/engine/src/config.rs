use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::store::{StoreDescriptor, StoreEngine};

/// Default time a source waits before re-probing the same asset (one day).
pub const DEFAULT_TTL_MINUTES: u64 = 1440;
/// Interval at which session cancellation polls for quiescence.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Connection details for one graph database.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub primary: bool,
    pub system: String,
    pub host: String,
    pub port: String,
    pub username: String,
    pub password: String,
    pub db_name: String,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("primary", &self.primary)
            .field("system", &self.system)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("db_name", &self.db_name)
            .finish_non_exhaustive()
    }
}

/// TTL override for one asset transformation (`from` → `to`).
///
/// `to` is an asset type name, a plugin name, or `"all"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transformation {
    pub from: String,
    pub to: String,
    pub ttl_minutes: Option<u64>,
}

/// Per-source rate and TTL settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub rate_per_second: Option<u32>,
    pub burst: Option<u32>,
    pub ttl_minutes: Option<u64>,
}

/// Enumeration configuration. Immutable once a session is created from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub domains: Vec<String>,
    pub addresses: Vec<IpAddr>,
    pub cidrs: Vec<IpNet>,
    pub asns: Vec<u32>,
    pub ports: Vec<u16>,
    pub graph_dbs: Vec<DatabaseConfig>,
    pub output_dir: Option<PathBuf>,
    pub min_confidence: u8,
    pub default_ttl_minutes: u64,
    pub transformations: Vec<Transformation>,
    pub sources: HashMap<String, SourceSettings>,
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            addresses: Vec::new(),
            cidrs: Vec::new(),
            asns: Vec::new(),
            ports: Vec::new(),
            graph_dbs: Vec::new(),
            output_dir: None,
            min_confidence: 0,
            default_ttl_minutes: DEFAULT_TTL_MINUTES,
            transformations: Vec::new(),
            sources: HashMap::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let mut cfg = Self::default();

        if let Ok(domains) = env::var("SURFACE_DOMAINS") {
            cfg.domains = domains
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect();
        }
        cfg.output_dir = env::var("SURFACE_OUTPUT_DIR").ok().map(PathBuf::from);
        if let Ok(conf) = env::var("SURFACE_MIN_CONFIDENCE") {
            cfg.min_confidence = conf
                .parse()
                .context("SURFACE_MIN_CONFIDENCE must be a number between 0 and 255")?;
        }
        if let Ok(ttl) = env::var("SURFACE_DEFAULT_TTL") {
            cfg.default_ttl_minutes = ttl
                .parse()
                .context("SURFACE_DEFAULT_TTL must be a number of minutes")?;
        }
        if let Ok(system) = env::var("SURFACE_DB_SYSTEM") {
            cfg.graph_dbs.push(DatabaseConfig {
                primary: true,
                system,
                host: env::var("SURFACE_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env::var("SURFACE_DB_PORT").unwrap_or_else(|_| "5432".to_string()),
                username: env::var("SURFACE_DB_USER").unwrap_or_default(),
                password: env::var("SURFACE_DB_PASSWORD").unwrap_or_default(),
                db_name: env::var("SURFACE_DB_NAME").unwrap_or_default(),
            });
        }

        Ok(cfg)
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domains.push(domain.into());
        self
    }

    pub fn with_cidr(mut self, cidr: IpNet) -> Self {
        self.cidrs.push(cidr);
        self
    }

    pub fn with_asn(mut self, asn: u32) -> Self {
        self.asns.push(asn);
        self
    }

    pub fn with_database(mut self, db: DatabaseConfig) -> Self {
        self.graph_dbs.push(db);
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_min_confidence(mut self, confidence: u8) -> Self {
        self.min_confidence = confidence;
        self
    }

    pub fn with_transformation(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        ttl_minutes: Option<u64>,
    ) -> Self {
        self.transformations.push(Transformation {
            from: from.into(),
            to: to.into(),
            ttl_minutes,
        });
        self
    }

    pub fn with_source(mut self, name: impl Into<String>, settings: SourceSettings) -> Self {
        self.sources.insert(name.into(), settings);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Resolve the primary database into a connection descriptor.
    ///
    /// With no databases configured the session runs on the in-memory store.
    pub fn primary_store(&self) -> Result<StoreDescriptor, EngineError> {
        if self.graph_dbs.is_empty() {
            return Ok(StoreDescriptor::memory());
        }

        let db = self
            .graph_dbs
            .iter()
            .find(|db| db.primary)
            .ok_or(EngineError::NoPrimaryDatabase)?;
        let engine = StoreEngine::parse(&db.system).ok_or(EngineError::NoPrimaryDatabase)?;

        let dsn = match engine {
            StoreEngine::Postgres => format!(
                "host={} port={} user={} password={} dbname={}",
                db.host, db.port, db.username, db.password, db.db_name
            ),
            StoreEngine::Sqlite => self
                .output_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("assets.sqlite")
                .to_string_lossy()
                .into_owned(),
            StoreEngine::Memory => String::new(),
        };

        Ok(StoreDescriptor { engine, dsn })
    }

    /// TTL for a transformation, most specific rule first.
    pub fn ttl_for(&self, from: &str, to: &str, plugin: &str) -> Duration {
        let matching = |target: &str| {
            self.transformations
                .iter()
                .filter(|t| t.from.eq_ignore_ascii_case(from))
                .find(|t| t.to.eq_ignore_ascii_case(target))
                .and_then(|t| t.ttl_minutes)
        };

        let minutes = matching(to)
            .or_else(|| matching(plugin))
            .or_else(|| matching("all"))
            .or_else(|| self.sources.get(plugin).and_then(|s| s.ttl_minutes))
            .unwrap_or(self.default_ttl_minutes);

        Duration::from_secs(minutes.saturating_mul(60))
    }

    /// Rate limiter for a source, if the configuration sets a rate for it.
    pub fn rate_limiter_for(&self, source: &str) -> Option<Arc<DefaultDirectRateLimiter>> {
        let settings = self.sources.get(source)?;
        let rate = NonZeroU32::new(settings.rate_per_second?)?;
        let mut quota = Quota::per_second(rate);
        if let Some(burst) = settings.burst.and_then(NonZeroU32::new) {
            quota = quota.allow_burst(burst);
        }
        Some(Arc::new(RateLimiter::direct(quota)))
    }
}
