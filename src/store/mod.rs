//! Counter store contract and the bundled implementations.
//!
//! The throttle engine keeps no counters of its own. Every count lives in a
//! [`CounterStore`], which is responsible for expiring keys once their TTL
//! runs out.

mod memory;
mod mesh;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Result, StoreError};

pub use memory::{IncrementMode, MemoryStore};
pub use mesh::{MeshConfig, MeshStore};

/// Trait for key-value stores with per-key expiry.
///
/// Any store offering `get` and `set_if_absent` satisfies the contract.
/// Atomic `increment` is an optimization: stores that cannot offer it
/// return [`StoreError::Unsupported`] and the engine falls back to the
/// conditional-create path.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to `key` and return the new value.
    ///
    /// Stores that create missing keys do so with a TTL of `ttl_secs`.
    /// Stores that do not may return [`StoreError::KeyMissing`].
    async fn increment(&self, key: &str, ttl_secs: u64) -> std::result::Result<i64, StoreError>;

    /// Read the current value of `key`, if it exists and has not expired.
    async fn get(&self, key: &str) -> std::result::Result<Option<i64>, StoreError>;

    /// Create `key` with `value` unless it already exists.
    ///
    /// Returns `true` if this call created the entry.
    async fn set_if_absent(
        &self,
        key: &str,
        value: i64,
        ttl_secs: u64,
    ) -> std::result::Result<bool, StoreError>;

    /// Overwrite `key` with `value` and a fresh TTL.
    async fn set(&self, key: &str, value: i64, ttl_secs: u64) -> std::result::Result<(), StoreError>;
}

/// The counter store selected by [`StoreConfig::backend`].
///
/// Build it once at startup and share [`ConfiguredStore::counter_store`]
/// with the engine.
pub enum ConfiguredStore {
    /// Process-local store
    Memory(Arc<MemoryStore>),
    /// Gossip-replicated store
    Mesh(Arc<MeshStore>),
}

impl ConfiguredStore {
    /// Open the configured backend. A mesh backend joins its cluster here.
    pub async fn open(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        match config.backend {
            StoreBackend::Memory => {
                info!("Using in-process counter store");
                Ok(Self::Memory(Arc::new(MemoryStore::with_clock(clock))))
            }
            StoreBackend::Mesh => {
                let store = MeshStore::start(config.mesh.clone(), clock).await?;
                Ok(Self::Mesh(Arc::new(store)))
            }
        }
    }

    /// The store as a trait object for the engine.
    pub fn counter_store(&self) -> Arc<dyn CounterStore> {
        match self {
            Self::Memory(store) => store.clone() as Arc<dyn CounterStore>,
            Self::Mesh(store) => store.clone() as Arc<dyn CounterStore>,
        }
    }

    /// Release the store. A mesh node leaves its cluster once no engine
    /// holds it any more.
    pub async fn close(self) -> Result<()> {
        match self {
            Self::Memory(_) => Ok(()),
            Self::Mesh(store) => match Arc::try_unwrap(store) {
                Ok(store) => store.shutdown().await,
                Err(_) => {
                    warn!("Mesh store still shared, skipping shutdown");
                    Ok(())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::net::SocketAddr;

    #[tokio::test]
    async fn test_open_memory_backend() {
        let clock = ManualClock::new(1_000);
        let store = ConfiguredStore::open(&StoreConfig::default(), Arc::new(clock.clone()))
            .await
            .unwrap();
        assert!(matches!(store, ConfiguredStore::Memory(_)));

        let counters = store.counter_store();
        assert_eq!(counters.increment("k", 60).await, Ok(1));

        // The configured clock drives expiry
        clock.advance(60);
        assert_eq!(counters.get("k").await, Ok(None));

        drop(counters);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_mesh_backend() {
        let mut config = StoreConfig {
            backend: StoreBackend::Mesh,
            ..Default::default()
        };
        config.mesh.node_id = "configured-node".to_string();
        config.mesh.listen_addr = SocketAddr::from(([127, 0, 0, 1], 17951));

        let store = ConfiguredStore::open(&config, Arc::new(ManualClock::new(1_000)))
            .await
            .unwrap();
        match &store {
            ConfiguredStore::Mesh(mesh) => assert_eq!(mesh.node_id(), "configured-node"),
            ConfiguredStore::Memory(_) => panic!("expected a mesh store"),
        }

        let counters = store.counter_store();
        assert_eq!(counters.increment("k", 60).await, Ok(1));

        drop(counters);
        store.close().await.unwrap();
    }
}
