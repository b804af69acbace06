//! Pool bootstrap and refresh, swarm lookup and failure feedback.

use rand::seq::SliceRandom;
use serde_json::Value;
use swarmlink_core::message::{
    self, get_swarm_params, rpc_body, seed_request_body, service_nodes_params, RpcMethod,
};
use swarmlink_core::node::parse_swarm_nodes;
use swarmlink_core::store::records::{self, PoolRecord, SwarmRecord, POOL_KEY};
use swarmlink_core::{Eviction, Node, NodeError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::network::{unix_ms, Network};

impl Network {
    /// Any pool member, refreshing the pool first when it is too small or stale.
    pub async fn get_random_node(&self) -> Result<Node, NodeError> {
        let needs_refresh = self
            .inner
            .directory
            .lock()
            .await
            .needs_pool_refresh(unix_ms());
        if needs_refresh {
            self.refresh_pool().await?;
        }
        self.inner
            .directory
            .lock()
            .await
            .random_node()
            .ok_or(NodeError::InsufficientNodes)
    }

    /// Snapshot of the pool, refreshed if needed.
    pub async fn pool(&self) -> Result<Vec<Node>, NodeError> {
        self.get_random_node().await?;
        Ok(self.inner.directory.lock().await.pool())
    }

    /// Refresh the pool. Concurrent callers share one refresh.
    async fn refresh_pool(&self) -> Result<(), NodeError> {
        let _guard = self.inner.pool_refresh.lock().await;
        let (needs_refresh, large_enough) = {
            let dir = self.inner.directory.lock().await;
            (
                dir.needs_pool_refresh(unix_ms()),
                dir.pool_len() >= dir.config().minimum_pool_size,
            )
        };
        if !needs_refresh {
            return Ok(());
        }
        let nodes = if large_enough {
            match self.pool_from_nodes().await {
                Ok(nodes) => nodes,
                Err(e) => {
                    debug!(error = %e, "pool refresh from nodes failed, using seeds");
                    self.pool_from_seeds().await?
                }
            }
        } else {
            self.pool_from_seeds().await?
        };
        let now = unix_ms();
        self.inner
            .directory
            .lock()
            .await
            .replace_pool(nodes.clone(), now);
        self.persist(
            POOL_KEY,
            &PoolRecord {
                nodes,
                refreshed_at: Some(now),
            },
        );
        Ok(())
    }

    /// Ask a random seed; retried with a fixed backoff against possibly different seeds.
    async fn pool_from_seeds(&self) -> Result<Vec<Node>, NodeError> {
        let config = self.config();
        let attempts = config.seed_attempts.max(1);
        for attempt in 1..=attempts {
            let seed = config
                .seed_nodes
                .choose(&mut rand::thread_rng())
                .ok_or(NodeError::InsufficientNodes)?;
            match self.fetch_seed(seed).await {
                Ok(nodes) if !nodes.is_empty() => {
                    info!(seed = %seed, size = nodes.len(), "pool bootstrapped from seed");
                    return Ok(nodes);
                }
                Ok(_) => warn!(seed = %seed, attempt, "seed returned no nodes"),
                Err(e) => warn!(seed = %seed, attempt, error = %e, "seed request failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(config.seed_backoff).await;
            }
        }
        Err(NodeError::InsufficientNodes)
    }

    async fn fetch_seed(&self, seed: &str) -> Result<Vec<Node>, NodeError> {
        let response = self
            .client()
            .post(format!("{seed}/json_rpc"))
            .header("Content-Type", "application/json")
            .body(seed_request_body().to_string())
            .send()
            .await
            .map_err(|_| NodeError::Transient { status: 0 })?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|_| NodeError::Transient { status })?;
        if let Some(err) = swarmlink_core::classify_status(status, &text) {
            return Err(err);
        }
        let json: Value =
            serde_json::from_str(&text).map_err(|e| NodeError::InvalidResponse(e.to_string()))?;
        Ok(message::parse_nodes(&json))
    }

    /// Ask several pool members for their view and keep the nodes they all list.
    async fn pool_from_nodes(&self) -> Result<Vec<Node>, NodeError> {
        let sample: Vec<Node> = {
            let dir = self.inner.directory.lock().await;
            dir.pool()
                .choose_multiple(&mut rand::thread_rng(), self.config().pool_refresh_sample)
                .cloned()
                .collect()
        };
        if sample.len() < self.config().pool_refresh_sample {
            return Err(NodeError::InsufficientNodes);
        }
        let mut set = JoinSet::new();
        for node in sample {
            let network = self.clone();
            set.spawn(async move {
                // Direct: path building may be waiting on this refresh.
                let body = rpc_body(RpcMethod::OxendRequest, service_nodes_params());
                let timeout = network.config().rpc_timeout;
                network
                    .send_direct(&node, &body, &[], timeout)
                    .await
                    .map(|json| message::parse_nodes(&json))
            });
        }
        let mut views: Vec<Vec<Node>> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(nodes)) => views.push(nodes),
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(NodeError::InvalidResponse(e.to_string())),
            }
        }
        let Some((first, rest)) = views.split_first() else {
            return Err(NodeError::InsufficientNodes);
        };
        let agreed: Vec<Node> = first
            .iter()
            .filter(|n| rest.iter().all(|view| view.contains(n)))
            .cloned()
            .collect();
        if agreed.len() <= self.config().pool_refresh_agreement {
            warn!(agreed = agreed.len(), "too few nodes agreed on the pool");
            return Err(NodeError::InsufficientNodes);
        }
        info!(size = agreed.len(), "pool refreshed from nodes");
        Ok(agreed)
    }

    /// Swarm for `identity`. Uses the cache unless forced or below the minimum size.
    pub async fn get_swarm(&self, identity: &str, force_refresh: bool) -> Result<Vec<Node>, NodeError> {
        if !force_refresh {
            if let Some(swarm) = self.cached_or_persisted_swarm(identity).await {
                return Ok(swarm);
            }
        }
        let attempts = self.config().swarm_attempts.max(1);
        let mut attempt = 0;
        let json = loop {
            attempt += 1;
            // A failed node may have been evicted; pick again each attempt.
            let node = self.get_random_node().await?;
            match self
                .invoke(RpcMethod::GetSwarm, &node, Some(identity), get_swarm_params(identity))
                .await
            {
                Ok(json) => break json,
                Err(e)
                    if attempt < attempts
                        && (e.is_transient() || matches!(e, NodeError::PathHopMissing { .. })) =>
                {
                    debug!(identity, attempt, error = %e, "swarm lookup failed, retrying");
                }
                Err(e) => return Err(e),
            }
        };
        let swarm = parse_swarm_nodes(&json);
        let minimum = self.config().directory.minimum_swarm_size;
        if swarm.len() < minimum {
            warn!(identity, size = swarm.len(), "swarm response too small");
            return Err(NodeError::InsufficientNodes);
        }
        self.set_swarm(identity, swarm.clone()).await;
        debug!(identity, size = swarm.len(), "swarm refreshed");
        Ok(swarm)
    }

    async fn cached_or_persisted_swarm(&self, identity: &str) -> Option<Vec<Node>> {
        let mut dir = self.inner.directory.lock().await;
        if let Some(swarm) = dir.cached_swarm(identity) {
            return Some(swarm);
        }
        if dir.swarm(identity).is_some() {
            return None;
        }
        let key = records::swarm_key(identity);
        match records::load::<SwarmRecord>(self.kv_store().as_ref(), &key) {
            Ok(Some(record)) => {
                if dir.set_swarm(identity, record.nodes) {
                    dir.cached_swarm(identity)
                } else {
                    None
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!(identity, error = %e, "ignoring persisted swarm");
                None
            }
        }
    }

    pub(crate) async fn set_swarm(&self, identity: &str, nodes: Vec<Node>) -> bool {
        let accepted = self.inner.directory.lock().await.set_swarm(identity, nodes.clone());
        if accepted {
            self.persist(&records::swarm_key(identity), &SwarmRecord { nodes });
        }
        accepted
    }

    /// Random replication targets from the swarm.
    pub async fn get_target_nodes(&self, identity: &str) -> Result<Vec<Node>, NodeError> {
        self.get_swarm(identity, false).await?;
        self.inner
            .directory
            .lock()
            .await
            .target_nodes(identity)
            .ok_or(NodeError::InsufficientNodes)
    }

    /// Count a transient failure against `node`, persisting what an eviction touched.
    pub async fn record_failure(&self, node: &Node) {
        let eviction = self.inner.directory.lock().await.record_failure(node);
        if let Some(eviction) = eviction {
            self.persist_eviction(&eviction).await;
        }
    }

    pub async fn drop_node(&self, node: &Node) {
        let eviction = self.inner.directory.lock().await.drop_node(node);
        self.persist_eviction(&eviction).await;
    }

    pub async fn drop_from_swarm(&self, node: &Node, identity: &str) {
        let remaining = {
            let mut dir = self.inner.directory.lock().await;
            dir.drop_from_swarm(node, identity)
                .then(|| dir.swarm(identity).map(<[Node]>::to_vec))
                .flatten()
        };
        if let Some(nodes) = remaining {
            debug!(node = %node, identity, "node dropped from swarm");
            self.persist(&records::swarm_key(identity), &SwarmRecord { nodes });
        }
    }

    async fn persist_eviction(&self, eviction: &Eviction) {
        if eviction.is_empty() {
            return;
        }
        let (pool, refreshed_at, swarms) = {
            let dir = self.inner.directory.lock().await;
            let swarms: Vec<(String, Vec<Node>)> = eviction
                .swarms
                .iter()
                .filter_map(|id| dir.swarm(id).map(|s| (id.clone(), s.to_vec())))
                .collect();
            (dir.pool(), dir.pool_refreshed_at(), swarms)
        };
        if eviction.from_pool {
            self.persist(POOL_KEY, &PoolRecord { nodes: pool, refreshed_at });
        }
        for (identity, nodes) in swarms {
            self.persist(&records::swarm_key(&identity), &SwarmRecord { nodes });
        }
    }
}
