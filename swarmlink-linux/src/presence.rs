//! Presence manager: runs the tracker's actions with real timers and direct sends, and
//! delivers to contacts directly when online, through their swarm otherwise.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use swarmlink_core::{AddressMessage, Envelope, NodeError, PeerInfo, PresenceAction, PresenceTracker};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::network::unix_ms;
use crate::p2p::send_direct;
use crate::send::{SendOutcome, SendPipeline};

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Scheme and host contacts reach us on, e.g. `http://192.168.1.4`.
    pub advertised_address: String,
    pub advertised_port: u16,
    /// Timeout for pings and direct sends.
    pub direct_timeout: Duration,
}

/// How a message reached a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Direct,
    Swarm(SendOutcome),
}

#[derive(Clone)]
pub struct PresenceManager {
    inner: Arc<Inner>,
}

struct Inner {
    identity: String,
    config: PresenceConfig,
    tracker: Mutex<PresenceTracker>,
    timers: StdMutex<HashMap<String, JoinHandle<()>>>,
    /// Set by `shutdown`; no ping or timer starts afterwards.
    stopped: AtomicBool,
    client: reqwest::Client,
    pipeline: SendPipeline,
}

impl PresenceManager {
    pub fn new(
        identity: impl Into<String>,
        config: PresenceConfig,
        client: reqwest::Client,
        pipeline: SendPipeline,
    ) -> Self {
        let identity = identity.into();
        Self {
            inner: Arc::new(Inner {
                tracker: Mutex::new(PresenceTracker::new(identity.clone())),
                identity,
                config,
                timers: StdMutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                client,
                pipeline,
            }),
        }
    }

    pub async fn add_contact(&self, identity: &str) {
        self.inner.tracker.lock().await.add_contact(identity);
    }

    pub async fn remove_contact(&self, identity: &str) {
        let actions = self.inner.tracker.lock().await.remove_contact(identity);
        self.execute(actions);
    }

    pub async fn peer(&self, identity: &str) -> Option<PeerInfo> {
        self.inner.tracker.lock().await.peer(identity).cloned()
    }

    /// A contact advertised its address; `direct` when it arrived peer to peer.
    pub async fn on_address_message(&self, identity: &str, message: &AddressMessage, direct: bool) {
        let actions = self
            .inner
            .tracker
            .lock()
            .await
            .on_address_message(identity, message, direct);
        self.execute(actions);
    }

    /// Tell every contact where we can be reached. Returns how many were reached.
    pub async fn broadcast_presence(&self) -> usize {
        let contacts = self.inner.tracker.lock().await.contacts();
        let mut reached = 0;
        for contact in contacts {
            let envelope = match self.address_envelope(false) {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "cannot encode presence");
                    return reached;
                }
            };
            match self.deliver(&contact, &envelope).await {
                Ok(Delivery::Direct) | Ok(Delivery::Swarm(SendOutcome::Succeeded { .. })) => reached += 1,
                Ok(Delivery::Swarm(outcome)) => debug!(contact = %contact, ?outcome, "presence not stored"),
                Err(e) => debug!(contact = %contact, error = %e, "presence broadcast failed"),
            }
        }
        info!(reached, "presence broadcast");
        reached
    }

    /// Send `envelope` straight to an online contact; otherwise, or if that fails,
    /// through the contact's swarm.
    pub async fn deliver(&self, identity: &str, envelope: &Envelope) -> Result<Delivery, NodeError> {
        let target = self.inner.tracker.lock().await.direct_target(identity);
        if let Some((address, port)) = target {
            match send_direct(
                &self.inner.client,
                &address,
                port,
                identity,
                envelope,
                self.inner.config.direct_timeout,
            )
            .await
            {
                Ok(()) => return Ok(Delivery::Direct),
                Err(e) => {
                    debug!(contact = identity, error = %e, "direct delivery failed, using swarm");
                    let actions = self.inner.tracker.lock().await.on_ping_result(identity, false);
                    self.execute(actions);
                }
            }
        }
        let message = self.inner.pipeline.compose(identity, envelope, None)?;
        let outcome = self.inner.pipeline.send(message).await?;
        Ok(Delivery::Swarm(outcome))
    }

    /// Abort every ping timer. Pings still in flight finish without scheduling more.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        for (_, timer) in self.timers().drain() {
            timer.abort();
        }
    }

    fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn address_envelope(&self, is_ping: bool) -> Result<Envelope, NodeError> {
        let address = AddressMessage {
            address: self.inner.config.advertised_address.clone(),
            port: self.inner.config.advertised_port,
            is_ping,
        };
        Ok(Envelope::address(self.inner.identity.clone(), &address, unix_ms())?)
    }

    fn execute(&self, actions: Vec<PresenceAction>) {
        if self.is_stopped() {
            return;
        }
        for action in actions {
            match action {
                PresenceAction::Ping {
                    identity,
                    address,
                    port,
                } => {
                    let manager = self.clone();
                    tokio::spawn(async move { manager.ping(identity, address, port).await });
                }
                PresenceAction::Schedule { identity, interval } => self.schedule(identity, interval),
                PresenceAction::Cancel { identity } => {
                    if let Some(timer) = self.timers().remove(&identity) {
                        timer.abort();
                        debug!(contact = %identity, "ping timer cancelled");
                    }
                }
            }
        }
    }

    async fn ping(&self, identity: String, address: String, port: u16) {
        let reachable = match self.address_envelope(true) {
            Ok(envelope) => send_direct(
                &self.inner.client,
                &address,
                port,
                &identity,
                &envelope,
                self.inner.config.direct_timeout,
            )
            .await
            .is_ok(),
            Err(e) => {
                warn!(error = %e, "cannot encode ping");
                return;
            }
        };
        debug!(contact = %identity, reachable, "ping finished");
        let actions = self
            .inner
            .tracker
            .lock()
            .await
            .on_ping_result(&identity, reachable);
        self.execute(actions);
    }

    fn schedule(&self, identity: String, interval: Duration) {
        let manager = self.clone();
        let contact = identity.clone();
        let timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let due = manager.inner.tracker.lock().await.ping_due(&contact);
                if let Some(action) = due {
                    manager.execute(vec![action]);
                }
            }
        });
        let mut timers = self.timers();
        // Checked under the lock so a concurrent shutdown cannot miss this timer.
        if self.is_stopped() {
            timer.abort();
            return;
        }
        debug!(contact = %identity, ?interval, "ping timer scheduled");
        if let Some(previous) = timers.insert(identity, timer) {
            previous.abort();
        }
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use swarmlink_core::store::records::{self, PoolRecord, POOL_KEY};
    use swarmlink_core::{EnvelopeKind, MemoryStore, Node, PeerState};
    use tokio::net::TcpListener;

    use super::*;
    use crate::network::{Network, NetworkConfig};
    use crate::p2p::{read_http_request, write_http_response};
    use crate::send::SendConfig;
    use crate::testing::{ok, FakeNode};

    const CONTACT: &str = "05cc";

    fn manager(swarm: &[&FakeNode]) -> PresenceManager {
        let nodes: Vec<Node> = swarm.iter().map(|f| f.node()).collect();
        let store = Arc::new(MemoryStore::new());
        records::save(
            store.as_ref(),
            POOL_KEY,
            &PoolRecord {
                nodes: nodes.clone(),
                refreshed_at: Some(unix_ms()),
            },
        )
        .unwrap();
        let mut config = NetworkConfig {
            seed_nodes: Vec::new(),
            onion_requests: false,
            rpc_timeout: Duration::from_secs(5),
            ..NetworkConfig::default()
        };
        config.directory.minimum_pool_size = 1;
        let network = Network::new(config, store).unwrap();
        if nodes.len() >= 2 {
            assert!(network.inner.directory.try_lock().unwrap().set_swarm(CONTACT, nodes));
        }
        let manager = PresenceManager::new(
            "05aa",
            PresenceConfig {
                advertised_address: "http://127.0.0.1".into(),
                advertised_port: 8081,
                direct_timeout: Duration::from_secs(2),
            },
            reqwest::Client::new(),
            SendPipeline::new(network, SendConfig::default()),
        );
        manager.inner.tracker.try_lock().unwrap().add_contact(CONTACT);
        manager
    }

    fn at(peer: &FakeNode) -> AddressMessage {
        AddressMessage {
            address: "http://127.0.0.1".into(),
            port: peer.node().port,
            is_ping: false,
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    async fn wait_online(manager: &PresenceManager) {
        for _ in 0..100 {
            if manager.peer(CONTACT).await.map(|p| p.state) == Some(PeerState::Online) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("contact never came online");
    }

    #[tokio::test]
    async fn matching_direct_message_while_online_sends_nothing() {
        let peer = FakeNode::spawn(|_| ok(json!({}))).await;
        let manager = manager(&[]);
        manager.add_contact(CONTACT).await;

        manager.on_address_message(CONTACT, &at(&peer), true).await;
        wait_online(&manager).await;
        assert_eq!(peer.count("store"), 1);
        let info = manager.peer(CONTACT).await.unwrap();
        assert!(info.ping_interval.is_some());

        manager.on_address_message(CONTACT, &at(&peer), true).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(peer.count("store"), 1);
        manager.shutdown();
    }

    #[tokio::test]
    async fn address_change_while_online_pings_once() {
        let old = FakeNode::spawn(|_| ok(json!({}))).await;
        let new = FakeNode::spawn(|_| ok(json!({}))).await;
        let manager = manager(&[]);
        manager.on_address_message(CONTACT, &at(&old), true).await;
        wait_online(&manager).await;

        manager.on_address_message(CONTACT, &at(&new), true).await;
        wait_for(|| new.count("store") == 1).await;
        wait_online(&manager).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(new.count("store"), 1);
        assert_eq!(old.count("store"), 1);
        manager.shutdown();
    }

    #[tokio::test]
    async fn unreachable_contact_goes_offline() {
        let manager = manager(&[]);
        let gone = AddressMessage {
            address: "http://127.0.0.2".into(),
            port: 20_999,
            is_ping: false,
        };
        manager.on_address_message(CONTACT, &gone, false).await;
        for _ in 0..100 {
            let info = manager.peer(CONTACT).await.unwrap();
            if info.ping_interval == Some(swarmlink_core::presence::OFFLINE_RETRY_INTERVAL) {
                assert_eq!(info.state, PeerState::Offline);
                manager.shutdown();
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("offline retry never scheduled");
    }

    #[tokio::test]
    async fn delivery_prefers_direct_and_falls_back_to_swarm() {
        let peer = FakeNode::spawn(|_| ok(json!({}))).await;
        let a = FakeNode::spawn(|_| ok(json!({}))).await;
        let b = FakeNode::spawn(|_| ok(json!({}))).await;
        let manager = manager(&[&a, &b]);
        let envelope = Envelope {
            kind: EnvelopeKind::Ciphertext,
            source: "05aa".into(),
            source_device: 1,
            content: b"hi".to_vec(),
            timestamp: unix_ms(),
        };

        // Unknown contact: swarm.
        let delivery = manager.deliver(CONTACT, &envelope).await.unwrap();
        assert_eq!(
            delivery,
            Delivery::Swarm(SendOutcome::Succeeded { stored: 2, targets: 2 })
        );

        manager.on_address_message(CONTACT, &at(&peer), true).await;
        wait_online(&manager).await;
        assert_eq!(manager.deliver(CONTACT, &envelope).await.unwrap(), Delivery::Direct);
        assert_eq!(peer.count("store"), 2);
        manager.shutdown();
    }

    #[tokio::test]
    async fn unknown_identities_are_not_tracked() {
        let peer = FakeNode::spawn(|_| ok(json!({}))).await;
        let manager = manager(&[]);
        manager.on_address_message("05ff", &at(&peer), true).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.peer("05ff").await.is_none());
        assert_eq!(peer.count("store"), 0);
        assert!(manager.timers().is_empty());
        manager.shutdown();
    }

    #[tokio::test]
    async fn no_timer_survives_shutdown() {
        // Contact that answers pings slowly, so one is still in flight at shutdown.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let slow = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(Some(_)) = read_http_request(&mut stream).await {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        let _ = write_http_response(&mut stream, 200, b"{}").await;
                    }
                });
            }
        });
        let manager = manager(&[]);
        let address = AddressMessage {
            address: "http://127.0.0.1".into(),
            port,
            is_ping: false,
        };
        manager.on_address_message(CONTACT, &address, false).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.shutdown();

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(manager.timers().is_empty());
        slow.abort();
    }

    #[tokio::test]
    async fn broadcast_reaches_online_contacts() {
        let peer = FakeNode::spawn(|_| ok(json!({}))).await;
        let manager = manager(&[]);
        manager.on_address_message(CONTACT, &at(&peer), true).await;
        wait_online(&manager).await;
        assert_eq!(manager.broadcast_presence().await, 1);
        assert_eq!(peer.count("store"), 2);
        manager.shutdown();
    }
}
