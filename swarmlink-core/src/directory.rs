//! Node pool, per-identity swarm cache and failure accounting.
//! Single owner of all three; the host serialises mutations (e.g. behind a mutex).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::seq::{IteratorRandom, SliceRandom};
use tracing::{debug, info};

use crate::node::Node;

/// Default minimum pool size before a seed refresh is needed.
pub const DEFAULT_MINIMUM_POOL_SIZE: usize = 64;
/// Default minimum swarm size for a cached swarm to be usable.
pub const DEFAULT_MINIMUM_SWARM_SIZE: usize = 2;
/// Default number of swarm nodes a message is stored to.
pub const DEFAULT_TARGET_NODE_COUNT: usize = 2;
/// Default failures before a node is evicted.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 2;
/// Default pool age after which it is refreshed even if large enough.
pub const DEFAULT_POOL_EXPIRY: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub minimum_pool_size: usize,
    pub minimum_swarm_size: usize,
    pub target_node_count: usize,
    pub failure_threshold: u32,
    pub pool_expiry: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            minimum_pool_size: DEFAULT_MINIMUM_POOL_SIZE,
            minimum_swarm_size: DEFAULT_MINIMUM_SWARM_SIZE,
            target_node_count: DEFAULT_TARGET_NODE_COUNT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            pool_expiry: DEFAULT_POOL_EXPIRY,
        }
    }
}

/// What an eviction touched, so the host knows which records to persist.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub from_pool: bool,
    /// Identities whose swarm entry lost the node.
    pub swarms: Vec<String>,
}

impl Eviction {
    pub fn is_empty(&self) -> bool {
        !self.from_pool && self.swarms.is_empty()
    }
}

pub struct NodeDirectory {
    config: DirectoryConfig,
    pool: HashSet<Node>,
    /// Unix ms of the last wholesale pool replacement.
    pool_refreshed_at: Option<u64>,
    swarms: HashMap<String, Vec<Node>>,
    failures: HashMap<Node, u32>,
}

impl Default for NodeDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::with_config(DirectoryConfig::default())
    }

    pub fn with_config(config: DirectoryConfig) -> Self {
        Self {
            config,
            pool: HashSet::new(),
            pool_refreshed_at: None,
            swarms: HashMap::new(),
            failures: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Snapshot of the pool.
    pub fn pool(&self) -> Vec<Node> {
        self.pool.iter().cloned().collect()
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub fn pool_refreshed_at(&self) -> Option<u64> {
        self.pool_refreshed_at
    }

    /// True when the pool is below the minimum size or older than the expiry.
    pub fn needs_pool_refresh(&self, now_ms: u64) -> bool {
        if self.pool.len() < self.config.minimum_pool_size {
            return true;
        }
        let expiry_ms = self.config.pool_expiry.as_millis() as u64;
        match self.pool_refreshed_at {
            Some(at) => now_ms.saturating_sub(at) >= expiry_ms,
            None => true,
        }
    }

    /// Any pool member, uniformly at random.
    pub fn random_node(&self) -> Option<Node> {
        self.pool.iter().choose(&mut rand::thread_rng()).cloned()
    }

    /// Random pool member not in `exclude`.
    pub fn random_node_excluding(&self, exclude: &[Node]) -> Option<Node> {
        self.pool
            .iter()
            .filter(|n| !exclude.contains(n))
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// Replace the pool wholesale and stamp it as fresh.
    pub fn replace_pool(&mut self, nodes: Vec<Node>, now_ms: u64) {
        self.pool = nodes.into_iter().collect();
        self.pool_refreshed_at = Some(now_ms);
        self.failures.retain(|node, _| self.pool.contains(node));
        info!(size = self.pool.len(), "node pool replaced");
    }

    /// Restore a persisted pool without treating it as fresh unless `refreshed_at` says so.
    pub fn restore_pool(&mut self, nodes: Vec<Node>, refreshed_at: Option<u64>) {
        self.pool = nodes.into_iter().collect();
        self.pool_refreshed_at = refreshed_at;
    }

    /// Raw swarm entry, including one degraded below the minimum by evictions.
    pub fn swarm(&self, identity: &str) -> Option<&[Node]> {
        self.swarms.get(identity).map(Vec::as_slice)
    }

    /// Swarm entry only if it still meets the minimum size.
    pub fn cached_swarm(&self, identity: &str) -> Option<Vec<Node>> {
        self.swarms
            .get(identity)
            .filter(|nodes| nodes.len() >= self.config.minimum_swarm_size)
            .cloned()
    }

    /// Replace an identity's swarm wholesale. Lists below the minimum size are rejected.
    pub fn set_swarm(&mut self, identity: &str, nodes: Vec<Node>) -> bool {
        let mut seen = HashSet::new();
        let nodes: Vec<Node> = nodes.into_iter().filter(|n| seen.insert(n.clone())).collect();
        if nodes.len() < self.config.minimum_swarm_size {
            debug!(identity, size = nodes.len(), "rejecting undersized swarm");
            return false;
        }
        self.swarms.insert(identity.to_string(), nodes);
        true
    }

    /// Random subsample of the cached swarm used as replication targets.
    pub fn target_nodes(&self, identity: &str) -> Option<Vec<Node>> {
        let swarm = self.cached_swarm(identity)?;
        Some(
            swarm
                .choose_multiple(&mut rand::thread_rng(), self.config.target_node_count)
                .cloned()
                .collect(),
        )
    }

    /// Count a transient failure. Evicts the node once the threshold is reached.
    pub fn record_failure(&mut self, node: &Node) -> Option<Eviction> {
        let count = self.failures.entry(node.clone()).or_insert(0);
        *count += 1;
        debug!(node = %node, failures = *count, "node failure recorded");
        if *count >= self.config.failure_threshold {
            info!(node = %node, "failure threshold reached, evicting node");
            Some(self.drop_node(node))
        } else {
            None
        }
    }

    pub fn record_success(&mut self, node: &Node) {
        self.failures.remove(node);
    }

    pub fn failure_count(&self, node: &Node) -> u32 {
        self.failures.get(node).copied().unwrap_or(0)
    }

    /// Remove the node from the pool and every swarm. Idempotent.
    pub fn drop_node(&mut self, node: &Node) -> Eviction {
        self.failures.remove(node);
        let from_pool = self.pool.remove(node);
        let mut swarms = Vec::new();
        for (identity, nodes) in self.swarms.iter_mut() {
            let before = nodes.len();
            nodes.retain(|n| n != node);
            if nodes.len() != before {
                swarms.push(identity.clone());
            }
        }
        swarms.sort();
        Eviction { from_pool, swarms }
    }

    /// Remove the node from one identity's swarm only. Returns whether it was present.
    pub fn drop_from_swarm(&mut self, node: &Node, identity: &str) -> bool {
        match self.swarms.get_mut(identity) {
            Some(nodes) => {
                let before = nodes.len();
                nodes.retain(|n| n != node);
                nodes.len() != before
            }
            None => false,
        }
    }
}
