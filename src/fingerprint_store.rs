// Duplicate-fingerprint store
//
// Persists device-id sightings per project so that the same device
// answering through multiple survey links can be flagged. Backed by
// Redis/DragonflyDB for shared deployments, with an in-memory LRU double
// for tests and single-node embeds.
//
// Policy: exact match on the composite device hash. The same device id
// seen under a different uid within a project marks a duplicate; the same
// uid re-checking never does. Store failures degrade to "not a duplicate"
// so a cache outage cannot penalize legitimate respondents.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Key prefix for device sightings
const SIGHTING_PREFIX: &str = "panelguard:fp:";

/// Default TTL for sighting entries (30 days)
const DEFAULT_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// TTL for frequently seen devices (90 days)
const FREQUENT_TTL_SECS: u64 = 90 * 24 * 60 * 60;

/// Threshold for a "frequent" device
const FREQUENT_THRESHOLD: u64 = 25;

/// Maximum distinct uids tracked per device
const MAX_TRACKED_UIDS: usize = 20;

/// Sighting record for one device id within one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSighting {
    /// Link uid that first presented this device
    pub first_uid: String,
    /// Distinct uids seen with this device (bounded)
    pub uids: Vec<String>,
    /// Total sightings, across all uids
    pub sighting_count: u64,
    /// First seen (Unix seconds)
    pub first_seen: u64,
    /// Last seen (Unix seconds)
    pub last_seen: u64,
}

/// Cross-session sighting store for duplicate-respondent detection.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Record a sighting of `device_id` under `uid` within `project_id`.
    ///
    /// Returns true when the device was already seen under a *different*
    /// uid in the same project.
    async fn record_sighting(
        &self,
        project_id: &str,
        device_id: &str,
        uid: &str,
    ) -> Result<bool>;
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

fn sighting_key(project_id: &str, device_id: &str) -> String {
    format!("{}{}:{}", SIGHTING_PREFIX, project_id, device_id)
}

/// Apply one sighting to a record, returning whether it was a duplicate.
fn apply_sighting(sighting: &mut DeviceSighting, uid: &str) -> bool {
    let duplicate = sighting.uids.iter().any(|u| u != uid);
    if !sighting.uids.iter().any(|u| u == uid) && sighting.uids.len() < MAX_TRACKED_UIDS {
        sighting.uids.push(uid.to_string());
    }
    sighting.sighting_count += 1;
    sighting.last_seen = now_secs();
    duplicate
}

fn new_sighting(uid: &str) -> DeviceSighting {
    let now = now_secs();
    DeviceSighting {
        first_uid: uid.to_string(),
        uids: vec![uid.to_string()],
        sighting_count: 1,
        first_seen: now,
        last_seen: now,
    }
}

/// Redis/DragonflyDB-backed sighting store.
pub struct RedisFingerprintStore {
    connection: tokio::sync::Mutex<ConnectionManager>,
    default_ttl: u64,
}

impl RedisFingerprintStore {
    /// Connect to Redis/DragonflyDB.
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Failed to create Redis client")?;
        let connection = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis/DragonflyDB")?;
        Ok(Self {
            connection: tokio::sync::Mutex::new(connection),
            default_ttl: DEFAULT_TTL_SECS,
        })
    }

    /// Connect with a custom entry TTL.
    pub async fn with_ttl(redis_url: &str, ttl_secs: u64) -> Result<Self> {
        let mut store = Self::new(redis_url).await?;
        store.default_ttl = ttl_secs;
        Ok(store)
    }
}

#[async_trait]
impl FingerprintStore for RedisFingerprintStore {
    async fn record_sighting(
        &self,
        project_id: &str,
        device_id: &str,
        uid: &str,
    ) -> Result<bool> {
        let key = sighting_key(project_id, device_id);
        let mut connection = self.connection.lock().await;

        let existing = match connection.get::<_, Option<String>>(&key).await {
            Ok(value) => value,
            Err(e) => {
                // A cache outage must not flag legitimate respondents
                warn!("sighting GET error for {}: {}", key, e);
                return Ok(false);
            }
        };

        let (sighting, duplicate) = match existing {
            Some(json) => {
                let mut sighting: DeviceSighting = serde_json::from_str(&json)
                    .context("Failed to deserialize device sighting")?;
                let duplicate = apply_sighting(&mut sighting, uid);
                (sighting, duplicate)
            }
            None => (new_sighting(uid), false),
        };

        // Devices seen often get a longer retention window
        let ttl = if sighting.sighting_count >= FREQUENT_THRESHOLD {
            FREQUENT_TTL_SECS
        } else {
            self.default_ttl
        };

        let json = serde_json::to_string(&sighting).context("Failed to serialize sighting")?;
        if let Err(e) = connection.set_ex::<_, _, ()>(&key, &json, ttl).await {
            warn!("sighting SET error for {}: {}", key, e);
        }

        Ok(duplicate)
    }
}

/// In-memory LRU sighting store for tests and single-node embeds.
pub struct MemoryFingerprintStore {
    entries: Mutex<LruCache<String, DeviceSighting>>,
}

impl MemoryFingerprintStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl Default for MemoryFingerprintStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn record_sighting(
        &self,
        project_id: &str,
        device_id: &str,
        uid: &str,
    ) -> Result<bool> {
        let key = sighting_key(project_id, device_id);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sighting) = entries.get_mut(&key) {
            Ok(apply_sighting(sighting, uid))
        } else {
            entries.put(key, new_sighting(uid));
            Ok(false)
        }
    }
}
