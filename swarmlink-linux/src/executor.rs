//! RPC execution against storage nodes, directly or through an onion path, and the
//! failure feedback that keeps the directory and path cache honest.

use serde_json::Value;
use std::time::Duration;
use swarmlink_core::message::{self, retrieve_params, rpc_body, RpcMethod};
use swarmlink_core::onion::{self, build_onion};
use swarmlink_core::{classify_status, Node, NodeError, Path, RawMessage, StampedMessage};
use tracing::{debug, info, warn};

use crate::network::Network;
use crate::p2p::RPC_PATH;

pub const ONION_PATH: &str = "/onion_req/v2";
pub const LONG_POLL_HEADER: &str = "X-Loki-Long-Poll";

impl Network {
    /// Invoke `method` on `node`. `identity` is the mailbox the call concerns, used to
    /// apply swarm corrections from 421 responses.
    pub async fn invoke(
        &self,
        method: RpcMethod,
        node: &Node,
        identity: Option<&str>,
        params: Value,
    ) -> Result<Value, NodeError> {
        self.invoke_with(method, node, identity, params, &[], self.config().rpc_timeout)
            .await
    }

    async fn invoke_with(
        &self,
        method: RpcMethod,
        node: &Node,
        identity: Option<&str>,
        params: Value,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Value, NodeError> {
        let body = rpc_body(method, params);
        let result = if self.config().onion_requests {
            self.send_onion(node, &body, headers, timeout).await
        } else {
            self.send_direct(node, &body, headers, timeout).await
        };
        match result {
            Ok(json) => {
                self.inner.directory.lock().await.record_success(node);
                if let Some(server_ms) = message::server_timestamp(&json) {
                    self.observe_server_time(server_ms);
                }
                Ok(json)
            }
            Err(e) => {
                debug!(%method, node = %node, error = %e, "rpc failed");
                self.handle_error(node, identity, &e).await;
                Err(e)
            }
        }
    }

    pub(crate) async fn send_direct(
        &self,
        node: &Node,
        body: &Value,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Value, NodeError> {
        let mut request = self
            .client()
            .post(format!("{}{}", node.url(), RPC_PATH))
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .body(body.to_string());
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request
            .send()
            .await
            .map_err(|_| NodeError::Transient { status: 0 })?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|_| NodeError::Transient { status })?;
        if let Some(err) = classify_status(status, &text) {
            return Err(err);
        }
        parse_body(&text)
    }

    async fn send_onion(
        &self,
        node: &Node,
        body: &Value,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Value, NodeError> {
        let path = self.get_path(Some(node)).await?;
        let payload = onion::destination_payload(body, headers);
        let request = build_onion(&payload, node, &path)?;
        let sent = self
            .client()
            .post(format!("{}{}", request.guard.url(), ONION_PATH))
            .timeout(timeout)
            .body(request.body)
            .send()
            .await;
        let response = match sent {
            Ok(r) => r,
            Err(e) => {
                debug!(guard = %path.guard, error = %e, "guard unreachable");
                self.path_failed(&path).await;
                return Err(NodeError::Transient { status: 0 });
            }
        };
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        if let Some(err) = classify_status(status, &text) {
            match &err {
                NodeError::PathHopMissing { ed25519 } => self.repair_path(ed25519).await,
                _ => self.path_failed(&path).await,
            }
            return Err(err);
        }
        let inner = match onion::decrypt_response(&request.destination_key, &text) {
            Ok(inner) => inner,
            Err(e) => {
                self.path_failed(&path).await;
                return Err(e.into());
            }
        };
        if let Some(err) = classify_status(inner.status, &inner.body) {
            return Err(err);
        }
        parse_body(&inner.body)
    }

    /// Count a failure against the path; once it is dropped, every hop is suspect.
    async fn path_failed(&self, path: &Path) {
        let dropped = {
            let mut paths = self.inner.paths.lock().await;
            let dropped = paths.record_path_failure(path);
            if dropped {
                self.persist_paths(&paths);
            }
            dropped
        };
        if dropped {
            for hop in path.nodes() {
                self.record_failure(hop).await;
            }
        }
    }

    /// A relay could not reach `ed25519`: swap it out of its path and drop it from the pool.
    async fn repair_path(&self, ed25519: &str) {
        let pool = self.inner.directory.lock().await.pool();
        let repair = {
            let mut paths = self.inner.paths.lock().await;
            let repair = paths.repair_hop(ed25519, &pool);
            if repair.is_some() {
                self.persist_paths(&paths);
            }
            repair
        };
        match repair {
            Some(repair) => {
                info!(node = %repair.removed, "dropping unreachable hop");
                self.drop_node(&repair.removed).await;
            }
            None => debug!(ed25519, "missing hop is not on any path"),
        }
    }

    async fn handle_error(&self, node: &Node, identity: Option<&str>, err: &NodeError) {
        match err {
            NodeError::Transient { .. } => self.record_failure(node).await,
            NodeError::SwarmMembership { replacement } => {
                let Some(identity) = identity else {
                    return;
                };
                if self.set_swarm(identity, replacement.clone()).await {
                    info!(identity, size = replacement.len(), "swarm replaced from 421");
                } else {
                    self.drop_from_swarm(node, identity).await;
                }
            }
            NodeError::ProofOfWorkTooLow {
                difficulty: Some(d),
            } => {
                self.difficulty().suggest(*d);
            }
            NodeError::PathHopMissing { ed25519 } if node.ed25519() == Some(ed25519.as_str()) => {
                self.record_failure(node).await;
            }
            NodeError::ClockSkew => warn!(node = %node, "node reports clock skew"),
            _ => {}
        }
    }

    /// Messages after `last_hash`. Long polls ask the node to hold the request open.
    pub async fn retrieve(
        &self,
        node: &Node,
        identity: &str,
        last_hash: Option<&str>,
        long_poll: bool,
    ) -> Result<Vec<RawMessage>, NodeError> {
        let params = retrieve_params(identity, last_hash);
        let json = if long_poll {
            self.invoke_with(
                RpcMethod::Retrieve,
                node,
                Some(identity),
                params,
                &[(LONG_POLL_HEADER, "true")],
                self.config().long_poll_timeout,
            )
            .await?
        } else {
            self.invoke(RpcMethod::Retrieve, node, Some(identity), params)
                .await?
        };
        Ok(message::parse_messages(&json))
    }

    /// Store a stamped message on one node, adopting any difficulty it suggests.
    pub async fn store(&self, node: &Node, stamped: &StampedMessage) -> Result<Value, NodeError> {
        let identity = stamped.message().destination.as_str();
        let json = self
            .invoke(RpcMethod::Store, node, Some(identity), stamped.store_params())
            .await?;
        if let Some(d) = message::suggested_difficulty(&json) {
            self.difficulty().suggest(d);
        }
        Ok(json)
    }
}

fn parse_body(text: &str) -> Result<Value, NodeError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| NodeError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use swarmlink_core::store::records::{self, PathsRecord, PoolRecord, PATHS_KEY, POOL_KEY};
    use swarmlink_core::{MemoryStore, OutgoingMessage};

    use super::*;
    use crate::network::{unix_ms, NetworkConfig};
    use crate::testing::{ghost_node, offline_nodes, ok, swarm_body, FakeNode, Keyring};

    fn network(pool: Vec<Node>, paths: Vec<Path>, onion: bool) -> Network {
        let store = Arc::new(MemoryStore::new());
        records::save(
            store.as_ref(),
            POOL_KEY,
            &PoolRecord {
                nodes: pool,
                refreshed_at: Some(unix_ms()),
            },
        )
        .unwrap();
        if !paths.is_empty() {
            records::save(store.as_ref(), PATHS_KEY, &PathsRecord { paths }).unwrap();
        }
        let mut config = NetworkConfig {
            seed_nodes: Vec::new(),
            onion_requests: onion,
            rpc_timeout: Duration::from_secs(5),
            ..NetworkConfig::default()
        };
        config.directory.minimum_pool_size = 1;
        Network::new(config, store).unwrap()
    }

    fn stamped(destination: &str) -> StampedMessage {
        OutgoingMessage::new(destination, vec![1, 2, 3], None).stamp(1_700_000_000_000, "AAAAAAAAAAA=".into())
    }

    #[tokio::test]
    async fn transient_failures_evict_after_threshold() {
        let node = FakeNode::spawn(|_| (500, String::new())).await;
        let spare = offline_nodes(1);
        let mut pool = spare.clone();
        pool.push(node.node());
        let network = network(pool, Vec::new(), false);
        assert!(network.set_swarm("abc", vec![node.node(), spare[0].clone()]).await);

        for _ in 0..2 {
            let err = network
                .invoke(RpcMethod::GetSwarm, &node.node(), Some("abc"), json!({}))
                .await
                .unwrap_err();
            assert!(err.is_transient());
        }
        let dir = network.inner.directory.lock().await;
        assert!(!dir.pool().contains(&node.node()));
        assert_eq!(dir.swarm("abc").unwrap(), spare.as_slice());
    }

    #[tokio::test]
    async fn pow_suggestions_below_ceiling_are_adopted() {
        let node = FakeNode::spawn(|_| (432, json!({ "difficulty": 50 }).to_string())).await;
        let network = network(vec![node.node()], Vec::new(), false);
        let err = network.store(&node.node(), &stamped("05aa")).await.unwrap_err();
        assert!(matches!(err, NodeError::ProofOfWorkTooLow { difficulty: Some(50) }));
        assert_eq!(network.difficulty().get(), 50);

        let high = FakeNode::spawn(|_| (432, json!({ "difficulty": 150 }).to_string())).await;
        network.store(&high.node(), &stamped("05aa")).await.unwrap_err();
        assert_eq!(network.difficulty().get(), 50);
    }

    #[tokio::test]
    async fn store_success_can_suggest_difficulty() {
        let node = FakeNode::spawn(|_| ok(json!({ "difficulty": 7 }))).await;
        let network = network(vec![node.node()], Vec::new(), false);
        network.store(&node.node(), &stamped("05aa")).await.unwrap();
        assert_eq!(network.difficulty().get(), 7);
        let call = &node.calls()[0];
        assert_eq!(call.method, "store");
        assert_eq!(call.params["pubKey"], "05aa");
        assert_eq!(call.params["nonce"], "AAAAAAAAAAA=");
    }

    #[tokio::test]
    async fn misdirected_node_is_dropped_from_swarm() {
        let node = FakeNode::spawn(|_| (421, String::new())).await;
        let other = offline_nodes(2);
        let network = network(vec![node.node()], Vec::new(), false);
        let swarm = vec![node.node(), other[0].clone(), other[1].clone()];
        assert!(network.set_swarm("abc", swarm).await);

        let err = network
            .retrieve(&node.node(), "abc", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::SwarmMembership { .. }));
        let dir = network.inner.directory.lock().await;
        assert_eq!(dir.swarm("abc").unwrap(), other.as_slice());
        assert!(dir.pool().contains(&node.node()));
    }

    #[tokio::test]
    async fn misdirected_node_suggests_replacement_swarm() {
        let replacement = offline_nodes(3);
        let body = swarm_body(&replacement).to_string();
        let node = FakeNode::spawn(move |_| (421, body.clone())).await;
        let network = network(vec![node.node()], Vec::new(), false);
        assert!(network.set_swarm("abc", vec![node.node(), offline_nodes(1)[0].clone()]).await);

        network.retrieve(&node.node(), "abc", None, false).await.unwrap_err();
        assert_eq!(network.get_swarm("abc", false).await.unwrap(), replacement);
    }

    #[tokio::test]
    async fn clock_skew_surfaces() {
        let node = FakeNode::spawn(|_| (406, String::new())).await;
        let network = network(vec![node.node()], Vec::new(), false);
        let err = network.store(&node.node(), &stamped("05aa")).await.unwrap_err();
        assert!(matches!(err, NodeError::ClockSkew));
        assert!(err.is_terminal());
        assert_eq!(network.inner.directory.lock().await.failure_count(&node.node()), 0);
    }

    #[tokio::test]
    async fn long_poll_sets_header_and_parses_messages() {
        let node = FakeNode::spawn(|_| {
            ok(json!({
                "messages": [{ "hash": "h1", "expiration": 5, "data": "AAAA" }],
                "t": 1_000,
            }))
        })
        .await;
        let network = network(vec![node.node()], Vec::new(), false);
        let messages = network
            .retrieve(&node.node(), "abc", Some("h0"), true)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].hash, "h1");
        let call = &node.calls()[0];
        assert_eq!(call.header(LONG_POLL_HEADER), Some("true"));
        assert_eq!(call.params, json!({ "pubKey": "abc", "lastHash": "h0" }));

        network.retrieve(&node.node(), "abc", None, false).await.unwrap();
        let call = &node.calls()[1];
        assert_eq!(call.header(LONG_POLL_HEADER), None);
        assert_eq!(call.params["lastHash"], "");
    }

    #[tokio::test]
    async fn onion_request_reaches_destination() {
        let keyring = Keyring::default();
        let mut fakes = Vec::new();
        for _ in 0..7 {
            fakes.push(
                FakeNode::spawn_with_keyring(&keyring, |_| ok(json!({ "messages": [], "t": 42 }))).await,
            );
        }
        let nodes: Vec<Node> = fakes.iter().map(FakeNode::node).collect();
        let paths = vec![
            Path::new(nodes[0].clone(), nodes[1].clone(), nodes[2].clone()),
            Path::new(nodes[3].clone(), nodes[4].clone(), nodes[5].clone()),
        ];
        let network = network(nodes.clone(), paths, true);

        let destination = &fakes[6];
        network
            .retrieve(&destination.node(), "abc", None, true)
            .await
            .unwrap();
        let calls = destination.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].path, ONION_PATH);
        assert_eq!(calls[0].method, "retrieve");
        assert_eq!(calls[0].header(LONG_POLL_HEADER), Some("true"));
    }

    #[tokio::test]
    async fn missing_hop_is_repaired() {
        let keyring = Keyring::default();
        let mut fakes = Vec::new();
        for _ in 0..6 {
            fakes.push(FakeNode::spawn_with_keyring(&keyring, |_| ok(json!({}))).await);
        }
        let nodes: Vec<Node> = fakes.iter().map(FakeNode::node).collect();
        let ghost = ghost_node();
        let paths = vec![
            Path::new(nodes[0].clone(), ghost.clone(), nodes[1].clone()),
            Path::new(nodes[2].clone(), nodes[3].clone(), nodes[4].clone()),
        ];
        let mut pool = nodes.clone();
        pool.push(ghost.clone());
        let network = network(pool, paths, true);
        // The destination sits on the second path, so the first (broken) one is used.
        let destination = nodes[4].clone();

        let err = network
            .invoke(RpcMethod::GetSwarm, &destination, None, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::PathHopMissing { ref ed25519 } if Some(ed25519.as_str()) == ghost.ed25519()));
        {
            let dir = network.inner.directory.lock().await;
            assert!(!dir.pool().contains(&ghost));
            let paths = network.inner.paths.lock().await;
            assert!(paths.paths().iter().all(|p| !p.contains(&ghost)));
            assert_eq!(paths.paths().len(), 2);
        }

        network
            .invoke(RpcMethod::GetSwarm, &destination, None, json!({}))
            .await
            .unwrap();
        assert_eq!(fakes[4].count("get_snodes_for_pubkey"), 1);
    }
}
