//! Local port → fabric peer mapping with a fixed TTL.
//!
//! Tunnel-establishment tasks record which peer a locally bound port belongs
//! to; the fabric's packet layer looks it up at egress. Entries expire
//! passively: an expired entry is dropped the next time it is read.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::fabric::{PeerKey, PeerResolver};

/// Lifetime of a cache entry unless configured otherwise.
pub const DEFAULT_PEER_TTL: Duration = Duration::from_secs(5 * 60);

// Deadline used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, Copy)]
struct Entry {
    peer: PeerKey,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct PortPeerCache {
    entries: DashMap<u16, Entry>,
    ttl: Duration,
}

impl PortPeerCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_PEER_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Records `peer` for `port`, replacing any previous entry and restarting its TTL.
    pub fn set(&self, port: u16, peer: PeerKey) {
        let now = Instant::now();
        let expires_at = now
            .checked_add(self.ttl)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.entries.insert(port, Entry { peer, expires_at });
    }

    /// Current peer for `port`, or `None` if absent or expired.
    pub fn get(&self, port: u16) -> Option<PeerKey> {
        let now = Instant::now();
        match self.entries.get(&port) {
            Some(entry) if entry.expires_at > now => return Some(entry.peer),
            Some(_) => {}
            None => return None,
        }
        self.entries.remove_if(&port, |_, entry| entry.expires_at <= now);
        None
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PortPeerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerResolver for PortPeerCache {
    fn resolve(&self, port: u16) -> Option<PeerKey> {
        self.get(port)
    }
}

/// The capability handed to the fabric: lookups only.
pub fn resolver(cache: &Arc<PortPeerCache>) -> Arc<dyn PeerResolver> {
    cache.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(fill: u8) -> PeerKey {
        PeerKey::from_bytes([fill; 32])
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get() {
        let cache = PortPeerCache::new();
        cache.set(40000, peer(1));
        assert_eq!(cache.get(40000), Some(peer(1)));
        assert_eq!(cache.get(40001), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = PortPeerCache::with_ttl(Duration::from_secs(10));
        cache.set(40000, peer(1));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get(40000), Some(peer(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(40000), None);
        assert!(cache.is_empty(), "expired entry removed on access");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_refreshes_ttl_and_overwrites() {
        let cache = PortPeerCache::with_ttl(Duration::from_secs(10));
        cache.set(40000, peer(1));

        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set(40000, peer(2));

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get(40000), Some(peer(2)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(40000), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_ttl_is_five_minutes() {
        let cache = PortPeerCache::new();
        cache.set(1, peer(1));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(cache.get(1).is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_does_not_overflow() {
        let cache = PortPeerCache::with_ttl(Duration::from_secs(u64::MAX));
        cache.set(1, peer(1));

        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        assert_eq!(cache.get(1), Some(peer(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = PortPeerCache::with_ttl(Duration::from_secs(5));
        cache.set(1, peer(1));
        tokio::time::advance(Duration::from_secs(3)).await;
        cache.set(2, peer(2));
        tokio::time::advance(Duration::from_secs(3)).await;

        cache.purge_expired();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(2), Some(peer(2)));
    }

    #[tokio::test]
    async fn test_concurrent_set_get() {
        let cache = Arc::new(PortPeerCache::new());
        let mut handles = Vec::new();
        for i in 0..16u16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for port in (i * 100)..(i * 100 + 100) {
                    cache.set(port, peer(i as u8));
                    assert_eq!(cache.get(port), Some(peer(i as u8)));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cache.len(), 1600);
    }

    #[tokio::test]
    async fn test_resolver_view() {
        let cache = Arc::new(PortPeerCache::new());
        let resolver = resolver(&cache);
        cache.set(5000, peer(9));
        assert_eq!(resolver.resolve(5000), Some(peer(9)));
        assert_eq!(resolver.resolve(5001), None);
    }
}
