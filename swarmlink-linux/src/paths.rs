//! Guard probing and onion path construction.

use rand::RngCore;
use swarmlink_core::message::{get_swarm_params, rpc_body, RpcMethod};
use swarmlink_core::{Node, NodeError, Path};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::network::Network;

impl Network {
    /// Current guards, probing pool nodes until enough answer.
    pub async fn get_guard_nodes(&self) -> Result<Vec<Node>, NodeError> {
        let _build = self.inner.path_build.lock().await;
        self.ensure_guards().await
    }

    /// Rebuild every path from the current guards. Checks guard candidates first if needed.
    pub async fn build_paths(&self) -> Result<Vec<Path>, NodeError> {
        let _build = self.inner.path_build.lock().await;
        self.build_paths_locked().await
    }

    /// A cached path not containing `exclude`, building paths when too few are cached.
    pub async fn get_path(&self, exclude: Option<&Node>) -> Result<Path, NodeError> {
        if let Some(path) = self.inner.paths.lock().await.path(exclude) {
            return Ok(path);
        }
        let _build = self.inner.path_build.lock().await;
        {
            // Another caller may have built while we waited.
            let paths = self.inner.paths.lock().await;
            if let Some(path) = paths.path(exclude) {
                return Ok(path);
            }
            // Full cache, every path through `exclude`: rebuilding would discard working paths.
            if paths.has_enough_paths() {
                debug!("every cached path contains the destination");
                return Err(NodeError::InsufficientNodes);
            }
        }
        self.build_paths_locked().await?;
        self.inner
            .paths
            .lock()
            .await
            .path(exclude)
            .ok_or(NodeError::InsufficientNodes)
    }

    /// Callers hold `path_build`.
    async fn ensure_guards(&self) -> Result<Vec<Node>, NodeError> {
        let mut tried: Vec<Node> = Vec::new();
        loop {
            let pool = self.pool().await?;
            let candidates = {
                let paths = self.inner.paths.lock().await;
                if !paths.needs_guards() {
                    return Ok(paths.guards().to_vec());
                }
                let missing = self.config().paths.guard_count - paths.guards().len();
                paths.guard_candidates(&pool, &tried, missing)
            };
            if candidates.is_empty() {
                debug!(tried = tried.len(), "no guard candidates left");
                return Err(NodeError::InsufficientNodes);
            }
            tried.extend(candidates.iter().cloned());

            let mut checks = JoinSet::new();
            for candidate in candidates {
                let network = self.clone();
                checks.spawn(async move {
                    let reachable = network.check_reachable(&candidate).await;
                    (candidate, reachable)
                });
            }
            while let Some(joined) = checks.join_next().await {
                match joined {
                    Ok((node, true)) => {
                        self.inner.paths.lock().await.accept_guard(node);
                    }
                    Ok((node, false)) => self.record_failure(&node).await,
                    Err(e) => debug!(error = %e, "guard check task failed"),
                }
            }
        }
    }

    /// Direct swarm lookup for a throwaway identity under the check timeout.
    async fn check_reachable(&self, node: &Node) -> bool {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let identity = format!("05{}", hex::encode(key));
        let body = rpc_body(RpcMethod::GetSwarm, get_swarm_params(&identity));
        match self
            .send_direct(node, &body, &[], self.config().check_timeout)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!(node = %node, error = %e, "guard check failed");
                false
            }
        }
    }

    async fn build_paths_locked(&self) -> Result<Vec<Path>, NodeError> {
        self.ensure_guards().await?;
        let pool = self.pool().await?;
        let mut paths = self.inner.paths.lock().await;
        let built = paths.build_paths(&pool)?;
        self.persist_paths(&paths);
        info!(count = built.len(), "onion paths ready");
        Ok(built)
    }
}
