//! Shared network service: owns the node directory, the path cache and the HTTP client.
//! Pool and swarm lookup live in `directory.rs`, guards and paths in `paths.rs`, RPC
//! execution in `executor.rs`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use swarmlink_core::directory::DirectoryConfig;
use swarmlink_core::path::PathConfig;
use swarmlink_core::pow::Difficulty;
use swarmlink_core::store::records::{self, PathsRecord, PoolRecord, PATHS_KEY, POOL_KEY};
use swarmlink_core::{KeyValueStore, NodeDirectory, PathCache};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::DEFAULT_SEED_NODES;

/// Seed refresh attempts before the pool lookup fails.
pub const SEED_ATTEMPTS: usize = 4;
pub const SEED_BACKOFF: Duration = Duration::from_millis(250);
/// Swarm lookups tried against fresh random nodes before failing.
pub const SWARM_ATTEMPTS: usize = 4;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub seed_nodes: Vec<String>,
    pub onion_requests: bool,
    pub rpc_timeout: Duration,
    /// Guard reachability checks.
    pub check_timeout: Duration,
    pub long_poll_timeout: Duration,
    pub seed_attempts: usize,
    pub seed_backoff: Duration,
    pub swarm_attempts: usize,
    /// Nodes asked for their pool view when refreshing without seeds.
    pub pool_refresh_sample: usize,
    /// Nodes that must agree for a pool refresh from nodes to be accepted (exclusive).
    pub pool_refresh_agreement: usize,
    pub directory: DirectoryConfig,
    pub paths: PathConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            seed_nodes: DEFAULT_SEED_NODES.iter().map(|s| s.to_string()).collect(),
            onion_requests: true,
            rpc_timeout: Duration::from_secs(20),
            check_timeout: Duration::from_secs(3),
            long_poll_timeout: Duration::from_secs(40),
            seed_attempts: SEED_ATTEMPTS,
            seed_backoff: SEED_BACKOFF,
            swarm_attempts: SWARM_ATTEMPTS,
            pool_refresh_sample: 3,
            pool_refresh_agreement: 24,
            directory: DirectoryConfig::default(),
            paths: PathConfig::default(),
        }
    }
}

/// Cheap to clone; all clones share one directory and path cache.
#[derive(Clone)]
pub struct Network {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: NetworkConfig,
    pub(crate) client: reqwest::Client,
    pub(crate) directory: Mutex<NodeDirectory>,
    pub(crate) paths: Mutex<PathCache>,
    pub(crate) difficulty: Difficulty,
    pub(crate) store: Arc<dyn KeyValueStore>,
    /// Server clock minus local clock, ms.
    pub(crate) clock_offset_ms: AtomicI64,
    /// Serialises pool refreshes so concurrent callers share one.
    pub(crate) pool_refresh: Mutex<()>,
    /// Serialises guard selection and path building.
    pub(crate) path_build: Mutex<()>,
}

impl Network {
    /// Build the service and restore the persisted pool and paths.
    pub fn new(config: NetworkConfig, store: Arc<dyn KeyValueStore>) -> Result<Self, reqwest::Error> {
        // Storage nodes serve self-signed certificates.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(config.rpc_timeout)
            .build()?;
        let mut directory = NodeDirectory::with_config(config.directory.clone());
        match records::load::<PoolRecord>(store.as_ref(), POOL_KEY) {
            Ok(Some(pool)) => {
                debug!(size = pool.nodes.len(), "restored node pool");
                directory.restore_pool(pool.nodes, pool.refreshed_at);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "ignoring persisted node pool"),
        }
        let mut paths = PathCache::new(config.paths.clone());
        match records::load::<PathsRecord>(store.as_ref(), PATHS_KEY) {
            Ok(Some(record)) => paths.restore(record.paths),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "ignoring persisted onion paths"),
        }
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                client,
                directory: Mutex::new(directory),
                paths: Mutex::new(paths),
                difficulty: Difficulty::default(),
                store,
                clock_offset_ms: AtomicI64::new(0),
                pool_refresh: Mutex::new(()),
                path_build: Mutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    pub fn difficulty(&self) -> &Difficulty {
        &self.inner.difficulty
    }

    pub fn kv_store(&self) -> &Arc<dyn KeyValueStore> {
        &self.inner.store
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    /// Local clock corrected by the last observed server offset.
    pub fn network_time_ms(&self) -> u64 {
        let offset = self.inner.clock_offset_ms.load(Ordering::Relaxed);
        (unix_ms() as i64).saturating_add(offset).max(0) as u64
    }

    pub(crate) fn observe_server_time(&self, server_ms: u64) {
        let offset = server_ms as i64 - unix_ms() as i64;
        self.inner.clock_offset_ms.store(offset, Ordering::Relaxed);
        debug!(offset_ms = offset, "clock offset updated");
    }

    /// Persist a record; failures are logged, never fatal.
    pub(crate) fn persist<T: Serialize>(&self, key: &str, record: &T) {
        if let Err(e) = records::save(self.inner.store.as_ref(), key, record) {
            warn!(key, error = %e, "failed to persist record");
        }
    }

    pub(crate) fn persist_paths(&self, paths: &PathCache) {
        self.persist(
            PATHS_KEY,
            &PathsRecord {
                paths: paths.paths().to_vec(),
            },
        );
    }
}

pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmlink_core::node::{KeySet, Node, Path};
    use swarmlink_core::MemoryStore;

    fn keyed(i: u16) -> Node {
        Node::new(format!("http://10.9.0.{i}"), 1).with_keys(KeySet {
            ed25519: format!("ed{i}"),
            x25519: format!("x{i}"),
        })
    }

    #[tokio::test]
    async fn restores_pool_and_paths() {
        let store = Arc::new(MemoryStore::new());
        let nodes: Vec<Node> = (0..10).map(keyed).collect();
        records::save(
            store.as_ref(),
            POOL_KEY,
            &PoolRecord {
                nodes: nodes.clone(),
                refreshed_at: Some(5),
            },
        )
        .unwrap();
        let paths = vec![
            Path::new(keyed(0), keyed(1), keyed(2)),
            Path::new(keyed(3), keyed(4), keyed(5)),
        ];
        records::save(store.as_ref(), PATHS_KEY, &PathsRecord { paths }).unwrap();

        let network = Network::new(NetworkConfig::default(), store).unwrap();
        assert_eq!(network.inner.directory.lock().await.pool_len(), 10);
        let cache = network.inner.paths.lock().await;
        assert_eq!(cache.guards().len(), 2);
        assert_eq!(cache.paths().len(), 2);
    }

    #[tokio::test]
    async fn clock_offset_applies() {
        let network = Network::new(NetworkConfig::default(), Arc::new(MemoryStore::new())).unwrap();
        network.observe_server_time(unix_ms() + 60_000);
        let skew = network.network_time_ms() as i64 - unix_ms() as i64;
        assert!((59_000..=61_000).contains(&skew), "{skew}");
    }
}
