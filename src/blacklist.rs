//! Process-lifetime blacklist of known-forbidden cache sources.
//!
//! Two independent maps: one keyed by cache hit, one keyed by bucket prefix.
//! Writes are monotonic toward `Bad`: a `Good` entry may be downgraded when a
//! forbidden response is first observed, but `Bad` never recovers within the
//! process lifetime. Shared across every workflow in the process and safe for
//! concurrent readers and writers.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use uuid::Uuid;

/// Identity of a cache hit (a prior call whose outputs are reusable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheHitId(pub Uuid);

impl CacheHitId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CacheHitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CacheHitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistStatus {
    Untested,
    Good,
    Bad,
}

#[derive(Debug, Clone)]
pub struct BlacklistConfig {
    /// When false, hit lookups always answer `Untested`.
    pub hit_enabled: bool,
    /// When false, bucket lookups always answer `Untested`.
    pub bucket_enabled: bool,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            hit_enabled: true,
            bucket_enabled: true,
        }
    }
}

/// Shared blacklist cache.
pub struct BlacklistCache {
    config: BlacklistConfig,
    hits: RwLock<HashMap<CacheHitId, BlacklistStatus>>,
    buckets: RwLock<HashMap<String, BlacklistStatus>>,
}

impl BlacklistCache {
    pub fn new(config: BlacklistConfig) -> Self {
        Self {
            config,
            hits: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn hit_status(&self, hit: CacheHitId) -> BlacklistStatus {
        if !self.config.hit_enabled {
            return BlacklistStatus::Untested;
        }
        let hits = self.hits.read().expect("blacklist hits poisoned");
        hits.get(&hit).copied().unwrap_or(BlacklistStatus::Untested)
    }

    pub fn bucket_status(&self, bucket: &str) -> BlacklistStatus {
        if !self.config.bucket_enabled {
            return BlacklistStatus::Untested;
        }
        let buckets = self.buckets.read().expect("blacklist buckets poisoned");
        buckets
            .get(bucket)
            .copied()
            .unwrap_or(BlacklistStatus::Untested)
    }

    /// Mark a hit as known-forbidden.
    pub fn blacklist_hit(&self, hit: CacheHitId) {
        if !self.config.hit_enabled {
            return;
        }
        let mut hits = self.hits.write().expect("blacklist hits poisoned");
        if hits.insert(hit, BlacklistStatus::Bad) != Some(BlacklistStatus::Bad) {
            metrics::counter!("strand_blacklist_hit_writes_total").increment(1);
        }
    }

    /// Mark a hit as known-readable. Never overwrites `Bad`.
    pub fn whitelist_hit(&self, hit: CacheHitId) {
        if !self.config.hit_enabled {
            return;
        }
        let mut hits = self.hits.write().expect("blacklist hits poisoned");
        let entry = hits.entry(hit).or_insert(BlacklistStatus::Untested);
        if *entry != BlacklistStatus::Bad {
            *entry = BlacklistStatus::Good;
        }
    }

    /// Mark a bucket prefix as known-forbidden.
    pub fn blacklist_bucket(&self, bucket: &str) {
        if !self.config.bucket_enabled {
            return;
        }
        let mut buckets = self.buckets.write().expect("blacklist buckets poisoned");
        if buckets.insert(bucket.to_string(), BlacklistStatus::Bad)
            != Some(BlacklistStatus::Bad)
        {
            metrics::counter!("strand_blacklist_bucket_writes_total").increment(1);
        }
    }

    /// Mark a bucket prefix as known-readable. Never overwrites `Bad`.
    pub fn whitelist_bucket(&self, bucket: &str) {
        if !self.config.bucket_enabled {
            return;
        }
        let mut buckets = self.buckets.write().expect("blacklist buckets poisoned");
        let entry = buckets
            .entry(bucket.to_string())
            .or_insert(BlacklistStatus::Untested);
        if *entry != BlacklistStatus::Bad {
            *entry = BlacklistStatus::Good;
        }
    }
}
