use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::cache::{self, PortPeerCache};
use crate::config::Config;
use crate::error::Result;
use crate::fabric::{PacketAttributor, PeerResolver, VirtualNetwork};
use crate::proxy::ProxyOptions;
use crate::transport::{BufferPool, COPY_BUFFER_SIZE};

pub mod metrics;

pub use metrics::Metrics;

/// Process-wide resources shared by every tunnel.
pub struct AppState {
    pub config: Arc<RwLock<Config>>,
    pub cache: Arc<PortPeerCache>,
    pub pool: Arc<BufferPool>,
    pub metrics: Arc<Metrics>,
    /// Hook for the fabric's egress path; resolves through `cache`.
    pub attributor: Arc<PacketAttributor>,
    pub shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
}

impl AppState {
    pub fn new(config: Config) -> (Arc<Self>, broadcast::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);

        let cache = Arc::new(PortPeerCache::with_ttl(config.peer_cache_ttl()));
        let pool = Arc::new(BufferPool::new(
            config.proxy.buffer_pool_size,
            COPY_BUFFER_SIZE,
        ));
        let attributor = Arc::new(PacketAttributor::new(cache::resolver(&cache)));

        let state = Arc::new(Self {
            config: Arc::new(RwLock::new(config)),
            cache,
            pool,
            metrics: Arc::new(Metrics::new()),
            attributor,
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        });

        (state, shutdown_rx)
    }

    /// Lookup-only view of the port-peer cache.
    pub fn peer_resolver(&self) -> Arc<dyn PeerResolver> {
        cache::resolver(&self.cache)
    }

    /// Options for a proxy sharing this state's pool and metrics.
    pub async fn proxy_options(&self, network: Option<Arc<dyn VirtualNetwork>>) -> ProxyOptions {
        let config = self.config.read().await;
        ProxyOptions {
            role: config.proxy.role,
            network,
            pool: self.pool.clone(),
            metrics: self.metrics.clone(),
            connect_timeout: config.connect_timeout(),
            relay_header: config.proxy.relay_header.clone(),
        }
    }

    pub async fn update_config(&self, new_config: Config) -> Result<()> {
        crate::config::validate(&new_config)?;

        let mut config = self.config.write().await;
        *config = new_config;

        Ok(())
    }

    pub async fn shutdown(&self) {
        tracing::info!("Initiating application shutdown");
        self.shutting_down.store(true, Ordering::SeqCst);

        // Send shutdown signal to all components
        let _ = self.shutdown_tx.send(());

        self.cache.clear();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::fabric::PeerKey;

    #[tokio::test]
    async fn test_shutdown_signals_and_purges_cache() {
        let (state, mut rx) = AppState::new(Config::default());
        state.cache.set(4000, PeerKey::from_bytes([3; 32]));
        assert!(!state.is_shutting_down());

        state.shutdown().await;

        assert!(rx.recv().await.is_ok());
        assert!(state.cache.is_empty());
        assert!(state.is_shutting_down());
    }

    #[tokio::test]
    async fn test_attributor_sees_cache() {
        let (state, _rx) = AppState::new(Config::default());
        let peer = PeerKey::from_bytes([4; 32]);
        state.cache.set(4000, peer);

        assert_eq!(state.peer_resolver().resolve(4000), Some(peer));
        assert_eq!(state.attributor.peer_for_packet(&[]), None);
    }

    #[tokio::test]
    async fn test_proxy_options_follow_config() {
        let mut config = Config::default();
        config.proxy.role = Role::Relay;
        config.proxy.connect_timeout_ms = 1500;
        config.proxy.peer_cache_ttl_secs = 60;
        let (state, _rx) = AppState::new(config);

        let options = state.proxy_options(None).await;
        assert_eq!(options.role, Role::Relay);
        assert_eq!(options.connect_timeout.as_millis(), 1500);
        assert!(Arc::ptr_eq(&options.metrics, &state.metrics));
        assert_eq!(state.cache.ttl().as_secs(), 60);
    }

    #[tokio::test]
    async fn test_update_config_validates() {
        let (state, _rx) = AppState::new(Config::default());

        let mut bad = Config::default();
        bad.proxy.max_connections = 0;
        assert!(state.update_config(bad).await.is_err());

        let mut good = Config::default();
        good.proxy.port = 9999;
        state.update_config(good).await.unwrap();
        assert_eq!(state.config.read().await.proxy.port, 9999);
    }
}
