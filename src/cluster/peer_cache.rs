//! Peer state caches (§4.8).
//!
//! A generic TTL-keyed `senderID → payload` cache, instantiated once for
//! node stats and once for node job lists. `HandleBroadcast` is registered
//! as a `BroadcastSubscriber` (see `broadcaster.rs`) and extracts the
//! relevant variant out of the tagged `BroadcastMessage` oneof, ignoring
//! messages of the other kind — each cache only cares about its own slice
//! of the gossip stream.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::cluster::broadcaster::BroadcastSubscriber;
use crate::cluster::proto::broadcast_message::Payload;
use crate::cluster::proto::{BroadcastMessage, NodeJobs, NodeStats};

struct Entry<T> {
    payload: T,
    received_at: Instant,
}

/// TTL-bounded `senderID → T` cache. Entries older than `ttl` are treated
/// as absent by `get`/`get_all` but are only actually evicted lazily.
pub struct PeerCache<T: Clone> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<T>>>,
}

impl<T: Clone> PeerCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn update(&self, sender_id: String, payload: T) {
        self.entries.lock().unwrap().insert(
            sender_id,
            Entry {
                payload,
                received_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, sender_id: &str) -> Option<T> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(sender_id)?;
        if entry.received_at.elapsed() <= self.ttl {
            Some(entry.payload.clone())
        } else {
            None
        }
    }

    /// Snapshot of every entry still within its TTL.
    pub fn get_all(&self) -> HashMap<String, T> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(_, e)| e.received_at.elapsed() <= self.ttl)
            .map(|(k, e)| (k.clone(), e.payload.clone()))
            .collect()
    }
}

/// Subscriber adapter extracting `NodeStats` out of incoming broadcasts.
pub struct StatsCache {
    cache: PeerCache<NodeStats>,
}

impl StatsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: PeerCache::new(ttl),
        }
    }

    pub fn get(&self, sender_id: &str) -> Option<NodeStats> {
        self.cache.get(sender_id)
    }

    pub fn get_all(&self) -> HashMap<String, NodeStats> {
        self.cache.get_all()
    }
}

impl BroadcastSubscriber for StatsCache {
    fn on_broadcast(&self, msg: &BroadcastMessage) {
        if let Some(Payload::NodeStats(stats)) = &msg.payload {
            self.cache.update(msg.sender_id.clone(), stats.clone());
        }
    }
}

/// Subscriber adapter extracting `NodeJobs` out of incoming broadcasts.
pub struct JobsCache {
    cache: PeerCache<NodeJobs>,
}

impl JobsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: PeerCache::new(ttl),
        }
    }

    pub fn get(&self, sender_id: &str) -> Option<NodeJobs> {
        self.cache.get(sender_id)
    }

    pub fn get_all(&self) -> HashMap<String, NodeJobs> {
        self.cache.get_all()
    }
}

impl BroadcastSubscriber for JobsCache {
    fn on_broadcast(&self, msg: &BroadcastMessage) {
        if let Some(Payload::NodeJobs(jobs)) = &msg.payload {
            self.cache.update(msg.sender_id.clone(), jobs.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(cpu_pct: f64) -> NodeStats {
        NodeStats {
            cpu_pct,
            mem_bytes: 0,
            disk_bytes: 0,
            ingest_rate: 0.0,
            uptime_secs: 0,
        }
    }

    #[test]
    fn update_then_get_returns_payload() {
        let cache: PeerCache<NodeStats> = PeerCache::new(Duration::from_secs(10));
        cache.update("n1".into(), stats(50.0));
        assert_eq!(cache.get("n1").unwrap().cpu_pct, 50.0);
    }

    #[test]
    fn expired_entry_returns_none() {
        let cache: PeerCache<NodeStats> = PeerCache::new(Duration::from_millis(1));
        cache.update("n1".into(), stats(1.0));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("n1").is_none());
    }

    #[test]
    fn get_all_excludes_expired() {
        let cache: PeerCache<NodeStats> = PeerCache::new(Duration::from_millis(20));
        cache.update("fresh".into(), stats(1.0));
        std::thread::sleep(Duration::from_millis(40));
        cache.update("also_fresh".into(), stats(2.0));
        let all = cache.get_all();
        assert!(!all.contains_key("fresh"));
        assert!(all.contains_key("also_fresh"));
    }

    #[test]
    fn stats_cache_ignores_jobs_broadcast() {
        let cache = StatsCache::new(Duration::from_secs(10));
        cache.on_broadcast(&BroadcastMessage {
            sender_id: "n1".into(),
            timestamp_unix_ms: 0,
            payload: Some(Payload::NodeJobs(NodeJobs { jobs: vec![] })),
        });
        assert!(cache.get("n1").is_none());
    }

    #[test]
    fn stats_cache_stores_matching_broadcast() {
        let cache = StatsCache::new(Duration::from_secs(10));
        cache.on_broadcast(&BroadcastMessage {
            sender_id: "n1".into(),
            timestamp_unix_ms: 0,
            payload: Some(Payload::NodeStats(stats(75.0))),
        });
        assert_eq!(cache.get("n1").unwrap().cpu_pct, 75.0);
    }
}
