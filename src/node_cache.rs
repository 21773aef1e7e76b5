use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::types::NodeInfo;

const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedNodeInfo {
    pub info: NodeInfo,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    nodes: HashMap<String, CachedNodeInfo>,
}

/// In-memory node-info cache, optionally backed by a versioned JSON file.
/// Shared with the interrupt handler, which persists it on its own task.
#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: HashMap<String, CachedNodeInfo>,
}

pub type SharedNodeCache = Arc<Mutex<NodeCache>>;

impl NodeCache {
    /// Load the cache from `path`, discarding entries older than
    /// `lifetime_minutes`. A missing file yields an empty cache.
    pub fn load(path: &str, lifetime_minutes: i64) -> anyhow::Result<Self> {
        if path.is_empty() || !Path::new(path).exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read node cache {}", path))?;
        let file: CacheFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse node cache {}", path))?;
        if file.version != CACHE_SCHEMA_VERSION {
            warn!(
                "Node cache {} has schema version {}, expected {}; starting empty",
                path, file.version, CACHE_SCHEMA_VERSION
            );
            return Ok(Self::default());
        }
        let cutoff = Utc::now() - Duration::minutes(lifetime_minutes);
        let total = file.nodes.len();
        let nodes: HashMap<String, CachedNodeInfo> = file
            .nodes
            .into_iter()
            .filter(|(_, v)| v.cached_at >= cutoff)
            .collect();
        info!(
            "Loaded {} nodes from cache, discarded {} expired",
            nodes.len(),
            total - nodes.len()
        );
        Ok(Self { nodes })
    }

    pub fn get(&self, pub_key: &str) -> Option<&CachedNodeInfo> {
        self.nodes.get(pub_key)
    }

    pub fn insert(&mut self, info: NodeInfo) {
        self.nodes.insert(
            info.pub_key.clone(),
            CachedNodeInfo {
                info,
                cached_at: Utc::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Persist the cache atomically: write a temp file next to the target
    /// and rename it into place.
    pub fn save(&self, path: &str) -> anyhow::Result<()> {
        if path.is_empty() {
            return Ok(());
        }
        let file = CacheFile {
            version: CACHE_SCHEMA_VERSION,
            nodes: self.nodes.clone(),
        };
        let tmp = format!("{}.tmp", path);
        let raw = serde_json::to_string(&file)?;
        fs::write(&tmp, raw).with_context(|| format!("failed to write {}", tmp))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move {} into place", tmp))?;
        info!("Saved {} nodes to cache {}", self.nodes.len(), path);
        Ok(())
    }
}

/// Snapshot the shared cache under its lock and persist the copy, so the
/// main worker is never blocked on file IO.
pub fn save_shared(cache: &SharedNodeCache, path: &str) {
    let snapshot = {
        let guard = cache.lock().unwrap();
        NodeCache {
            nodes: guard.nodes.clone(),
        }
    };
    if let Err(e) = snapshot.save(path) {
        warn!("Failed to save node cache: {:#}", e);
    }
}
