//! Gossip-replicated counter store using Chitchat.
//!
//! Each node owns its own contribution to every counter and publishes it
//! through chitchat's node state. The value of a counter is the sum of the
//! contributions of all live nodes, so the store is eventually consistent:
//! an increment made on one node becomes visible to its peers after the next
//! gossip round.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
    NodeState,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::CounterStore;
use crate::clock::Clock;
use crate::error::{Result, StoreError, TurnstileError};

/// Prefix of every chitchat key holding a counter.
const COUNTER_PREFIX: &str = "counter|";

/// Our expired counters are deleted from the node state after this many writes.
const PURGE_INTERVAL: u64 = 64;

/// Configuration for a mesh store node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Unique node identifier.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// The address to listen on for gossip.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes. Defaults to `listen_addr`.
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,
    /// Seed nodes to bootstrap cluster membership.
    #[serde(default)]
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,
    /// How often to gossip with peers, in milliseconds.
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,
    /// Grace period before a dead node's state is deleted, in seconds.
    #[serde(default = "default_dead_node_grace_secs")]
    pub dead_node_grace_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            listen_addr: default_listen_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval_ms(),
            dead_node_grace_secs: default_dead_node_grace_secs(),
        }
    }
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "turnstile".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

fn default_dead_node_grace_secs() -> u64 {
    3600
}

impl MeshConfig {
    fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    fn advertise_addr(&self) -> SocketAddr {
        self.advertise_addr.unwrap_or(self.listen_addr)
    }
}

/// Name of the chitchat key holding a counter.
fn counter_key(key: &str) -> String {
    format!("{}{}", COUNTER_PREFIX, key)
}

/// Encode a contribution as `{count}|{expires_at}`.
fn encode_value(count: i64, expires_at: u64) -> String {
    format!("{}|{}", count, expires_at)
}

fn decode_value(raw: &str) -> Option<(i64, u64)> {
    let (count, expires_at) = raw.split_once('|')?;
    Some((count.parse().ok()?, expires_at.parse().ok()?))
}

/// A live contribution, or `None` if missing, malformed or expired.
fn live_value(raw: Option<&str>, now: u64) -> Option<(i64, u64)> {
    raw.and_then(decode_value)
        .filter(|(_, expires_at)| now < *expires_at)
}

/// Tombstone every counter in `node_state` that is no longer live.
///
/// Deleted keys stop being gossiped and chitchat garbage-collects the
/// tombstones after the grace period. Returns how many keys were deleted.
fn delete_expired(node_state: &mut NodeState, now: u64) -> usize {
    let expired: Vec<String> = node_state
        .iter_prefix(COUNTER_PREFIX)
        .filter(|(_, versioned)| live_value(Some(versioned.value.as_str()), now).is_none())
        .map(|(key, _)| key.to_string())
        .collect();

    for key in &expired {
        node_state.delete(key);
    }
    expired.len()
}

/// A counter store shared by every node of a chitchat cluster.
pub struct MeshStore {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    /// Time source for expiry stamps.
    clock: Arc<dyn Clock>,
    /// Writes since start, drives the expiry sweep.
    writes: AtomicU64,
}

impl std::fmt::Debug for MeshStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshStore")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl MeshStore {
    /// Create and start a mesh store node.
    pub async fn start(config: MeshConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr(),
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting mesh store node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr(),
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval(),
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval(),
                ..Default::default()
            },
            marked_for_deletion_grace_period: Duration::from_secs(config.dead_node_grace_secs),
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| TurnstileError::Store(StoreError::Unavailable(e.to_string())))?;

        info!("Mesh store node started");

        Ok(Self {
            node_id: config.node_id,
            handle,
            clock,
            writes: AtomicU64::new(0),
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Shutdown the node gracefully.
    pub async fn shutdown(self) -> Result<()> {
        info!(node_id = %self.node_id, "Shutting down mesh store node");
        self.handle.shutdown().await.map_err(|e| {
            TurnstileError::Store(StoreError::Unavailable(format!("shutdown error: {:?}", e)))
        })?;
        Ok(())
    }

    /// Delete our expired counters so they stop being gossiped.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        Self::purge_locked(&mut chitchat, now)
    }

    fn purge_locked(chitchat: &mut Chitchat, now: u64) -> usize {
        let removed = delete_expired(chitchat.self_node_state(), now);
        if removed > 0 {
            debug!(removed, "Deleted expired counter contributions");
        }
        removed
    }

    /// Count a write and sweep expired counters every `PURGE_INTERVAL` writes.
    fn note_write(&self, chitchat: &mut Chitchat, now: u64) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % PURGE_INTERVAL == 0 {
            Self::purge_locked(chitchat, now);
        }
    }

    /// Sum the live contributions to `key` across all live nodes.
    ///
    /// Returns `None` when no node holds a live contribution.
    fn sum_live(chitchat: &Chitchat, key: &str, now: u64) -> Option<i64> {
        let mut total: Option<i64> = None;

        for node_id in chitchat.live_nodes() {
            if let Some(node_state) = chitchat.node_state(node_id) {
                if let Some((count, _)) = live_value(node_state.get(key), now) {
                    total = Some(total.unwrap_or(0) + count);
                }
            }
        }

        total
    }
}

#[async_trait]
impl CounterStore for MeshStore {
    async fn increment(&self, key: &str, ttl_secs: u64) -> std::result::Result<i64, StoreError> {
        let now = self.clock.now();
        let chitchat_key = counter_key(key);
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let (current_local, expires_at) =
            live_value(chitchat.self_node_state().get(&chitchat_key), now)
                .unwrap_or((0, now.saturating_add(ttl_secs)));

        let new_local = current_local + 1;
        chitchat
            .self_node_state()
            .set(&chitchat_key, encode_value(new_local, expires_at));

        debug!(
            key = %chitchat_key,
            local_value = new_local,
            "Incremented local counter contribution"
        );
        self.note_write(&mut chitchat, now);

        Ok(Self::sum_live(&chitchat, &chitchat_key, now).unwrap_or(new_local))
    }

    async fn get(&self, key: &str) -> std::result::Result<Option<i64>, StoreError> {
        let now = self.clock.now();
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        Ok(Self::sum_live(&chitchat, &counter_key(key), now))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: i64,
        ttl_secs: u64,
    ) -> std::result::Result<bool, StoreError> {
        let now = self.clock.now();
        let chitchat_key = counter_key(key);
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        if Self::sum_live(&chitchat, &chitchat_key, now).is_some() {
            return Ok(false);
        }

        chitchat.self_node_state().set(
            &chitchat_key,
            encode_value(value, now.saturating_add(ttl_secs)),
        );
        self.note_write(&mut chitchat, now);
        Ok(true)
    }

    async fn set(&self, key: &str, value: i64, ttl_secs: u64) -> std::result::Result<(), StoreError> {
        let now = self.clock.now();
        let chitchat_key = counter_key(key);
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        // Only our own share can be written; pick it so the total lands on `value`.
        let total = Self::sum_live(&chitchat, &chitchat_key, now).unwrap_or(0);
        let own = live_value(chitchat.self_node_state().get(&chitchat_key), now)
            .map(|(count, _)| count)
            .unwrap_or(0);
        let others = total - own;
        let new_local = (value - others).max(0);

        chitchat.self_node_state().set(
            &chitchat_key,
            encode_value(new_local, now.saturating_add(ttl_secs)),
        );
        self.note_write(&mut chitchat, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};

    fn test_config(port: u16) -> MeshConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        MeshConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval_ms: 50,
            dead_node_grace_secs: 60,
        }
    }

    #[test]
    fn test_value_encoding() {
        assert_eq!(encode_value(12, 1_704_067_260), "12|1704067260");
        assert_eq!(decode_value("12|1704067260"), Some((12, 1_704_067_260)));
        assert_eq!(decode_value("garbage"), None);
        assert_eq!(decode_value("1|x"), None);
    }

    #[test]
    fn test_live_value_respects_expiry() {
        assert_eq!(live_value(Some("3|100"), 99), Some((3, 100)));
        assert_eq!(live_value(Some("3|100"), 100), None);
        assert_eq!(live_value(None, 0), None);
    }

    #[test]
    fn test_delete_expired_only_touches_dead_counters() {
        let mut node_state = NodeState::for_test();
        node_state.set("counter|old", encode_value(3, 100));
        node_state.set("counter|live", encode_value(1, 200));
        node_state.set("counter|garbled", "x");
        node_state.set("other", "kept");

        assert_eq!(delete_expired(&mut node_state, 150), 2);
        assert_eq!(node_state.get("counter|old"), None);
        assert_eq!(node_state.get("counter|live"), Some("1|200"));
        assert_eq!(node_state.get("other"), Some("kept"));
    }

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.cluster_id, "turnstile");
        assert_eq!(config.advertise_addr(), config.listen_addr);
        assert!(!config.node_id.is_empty());
    }

    #[tokio::test]
    async fn test_mesh_store_start() {
        let store = MeshStore::start(test_config(17946), Arc::new(SystemClock))
            .await
            .unwrap();

        assert_eq!(store.node_id(), "test-node-17946");
        assert_eq!(store.live_node_count().await, 1); // Just ourselves

        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_store_operations() {
        let clock = ManualClock::new(1_000);
        let store = MeshStore::start(test_config(17947), Arc::new(clock.clone()))
            .await
            .unwrap();

        assert_eq!(store.get("k").await, Ok(None));
        assert_eq!(store.increment("k", 60).await, Ok(1));
        assert_eq!(store.increment("k", 60).await, Ok(2));
        assert_eq!(store.get("k").await, Ok(Some(2)));

        assert!(!store.set_if_absent("k", 1, 60).await.unwrap());
        assert!(store.set_if_absent("other", 1, 60).await.unwrap());

        store.set("other", 5, 60).await.unwrap();
        assert_eq!(store.get("other").await, Ok(Some(5)));

        // Contributions expire with their TTL
        clock.advance(60);
        assert_eq!(store.get("k").await, Ok(None));
        assert_eq!(store.increment("k", 60).await, Ok(1));

        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_counters_are_not_retained() {
        let clock = ManualClock::new(1_000);
        let store = MeshStore::start(test_config(17950), Arc::new(clock.clone()))
            .await
            .unwrap();

        // One key per window, each expired by the time the next is written
        for i in 0..500 {
            store.increment(&format!("th:k:{}", i), 60).await.unwrap();
            clock.advance(60);
        }

        let retained = {
            let chitchat_arc = store.handle.chitchat();
            let mut chitchat = chitchat_arc.lock().await;
            chitchat.self_node_state().iter_prefix(COUNTER_PREFIX).count()
        };
        assert!(retained <= PURGE_INTERVAL as usize, "{} keys retained", retained);

        assert!(store.purge_expired().await > 0);
        assert_eq!(store.get("th:k:499").await, Ok(None));

        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_store_two_nodes() {
        let store1 = MeshStore::start(test_config(17948), Arc::new(SystemClock))
            .await
            .unwrap();

        let mut config2 = test_config(17949);
        config2.seed_nodes = vec!["127.0.0.1:17948".to_string()];
        let store2 = MeshStore::start(config2, Arc::new(SystemClock))
            .await
            .unwrap();

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(store1.live_node_count().await, 2);
        assert_eq!(store2.live_node_count().await, 2);

        for _ in 0..3 {
            store1.increment("shared", 3600).await.unwrap();
        }

        // Give time for gossip
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store2.get("shared").await, Ok(Some(3)));

        let total = store2.increment("shared", 3600).await.unwrap();
        assert_eq!(total, 4);

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store1.get("shared").await, Ok(Some(4)));

        store1.shutdown().await.unwrap();
        store2.shutdown().await.unwrap();
    }
}
