//! Receive loop: concurrent polling sessions over the local identity's swarm.
//!
//! Each session resolves the swarm, walks its nodes in random order and fetches with the
//! per-node cursor. New messages are deduplicated against a hash set shared by all
//! sessions and emitted before the next fetch. Short polling rotates to the next node
//! after a fixed number of fetches; long polling stays on a node until it fails. When
//! every node of a pass has failed, the session backs off and starts over.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::seq::SliceRandom;
use swarmlink_core::store::records::{self, CursorRecord, ReceivedHashesRecord};
use swarmlink_core::{CursorStore, Envelope, Node, NodeError, RawMessage, ReceivedHashes};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::network::Network;

pub const SHORT_POLLS_PER_NODE: usize = 6;
pub const SHORT_POLL_INTERVAL: Duration = Duration::from_millis(1500);
pub const EXHAUSTION_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStrategy {
    /// Rotate after `polls_per_node` fetches, waiting `interval` between fetches.
    Short {
        polls_per_node: usize,
        interval: Duration,
    },
    /// Hold a retrieve open on one node; rotate only on error.
    Long,
}

impl PollStrategy {
    pub fn short() -> Self {
        PollStrategy::Short {
            polls_per_node: SHORT_POLLS_PER_NODE,
            interval: SHORT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub strategy: PollStrategy,
    /// Concurrent sessions.
    pub sessions: usize,
    pub exhaustion_backoff: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            strategy: PollStrategy::Long,
            sessions: 3,
            exhaustion_backoff: EXHAUSTION_BACKOFF,
        }
    }
}

pub struct Poller {
    network: Network,
    identity: String,
    config: PollerConfig,
    cursors: Mutex<CursorStore>,
    received: Mutex<ReceivedHashes>,
}

/// Stops the sessions of a started poller.
pub struct PollerHandle {
    stop: watch::Sender<bool>,
    sessions: Vec<JoinHandle<()>>,
}

impl PollerHandle {
    /// No message is emitted after this returns. In-flight fetches drain and are discarded.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Stop and wait for every session to wind down.
    pub async fn join(self) {
        self.stop();
        for session in self.sessions {
            let _ = session.await;
        }
    }
}

enum Rotation {
    /// Node served its share of fetches.
    Exhausted,
    Failed,
    Stopped,
}

impl Poller {
    /// Restores the received-hash set persisted for `identity`.
    pub fn new(network: Network, identity: impl Into<String>, config: PollerConfig) -> Self {
        let identity = identity.into();
        let mut received = ReceivedHashes::new();
        match records::load::<ReceivedHashesRecord>(network.kv_store().as_ref(), &records::received_key(&identity)) {
            Ok(Some(record)) => {
                for (hash, forget_at) in record.entries {
                    received.insert(&identity, hash, forget_at);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "ignoring persisted received hashes"),
        }
        Self {
            network,
            identity,
            config,
            cursors: Mutex::new(CursorStore::new()),
            received: Mutex::new(received),
        }
    }

    pub fn start(self, sink: mpsc::Sender<Envelope>) -> PollerHandle {
        let (stop, stop_rx) = watch::channel(false);
        let sessions = self.config.sessions.max(1);
        let poller = Arc::new(self);
        info!(identity = %poller.identity, sessions, strategy = ?poller.config.strategy, "poller started");
        let sessions = (0..sessions)
            .map(|id| {
                let poller = poller.clone();
                let stop = stop_rx.clone();
                let sink = sink.clone();
                tokio::spawn(async move { poller.run_session(id, stop, sink).await })
            })
            .collect();
        PollerHandle { stop, sessions }
    }

    async fn run_session(&self, session: usize, mut stop: watch::Receiver<bool>, sink: mpsc::Sender<Envelope>) {
        while !*stop.borrow() {
            let mut unused = match self.network.get_swarm(&self.identity, false).await {
                Ok(swarm) => swarm,
                Err(e) => {
                    warn!(session, error = %e, "swarm lookup failed");
                    if pause(self.config.exhaustion_backoff, &mut stop).await {
                        return;
                    }
                    continue;
                }
            };
            unused.shuffle(&mut rand::thread_rng());
            let mut any_served = false;
            while let Some(node) = unused.pop() {
                debug!(session, node = %node, "polling node");
                match self.poll_node(&node, &mut stop, &sink).await {
                    Rotation::Exhausted => any_served = true,
                    Rotation::Failed => {}
                    Rotation::Stopped => return,
                }
            }
            if !any_served {
                info!(session, "every swarm node failed, backing off");
                if pause(self.config.exhaustion_backoff, &mut stop).await {
                    return;
                }
            }
        }
    }

    async fn poll_node(&self, node: &Node, stop: &mut watch::Receiver<bool>, sink: &mpsc::Sender<Envelope>) -> Rotation {
        let mut fetches = 0;
        loop {
            if *stop.borrow() {
                return Rotation::Stopped;
            }
            let fetched = self.fetch(node).await;
            if *stop.borrow() {
                return Rotation::Stopped;
            }
            let raw = match fetched {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(node = %node, error = %e, "fetch failed, rotating");
                    return Rotation::Failed;
                }
            };
            for envelope in self.accept(node, raw) {
                if sink.send(envelope).await.is_err() {
                    debug!("message sink closed");
                    return Rotation::Stopped;
                }
            }
            fetches += 1;
            match &self.config.strategy {
                PollStrategy::Short {
                    polls_per_node,
                    interval,
                } => {
                    if fetches >= *polls_per_node {
                        return Rotation::Exhausted;
                    }
                    if pause(*interval, stop).await {
                        return Rotation::Stopped;
                    }
                }
                PollStrategy::Long => {}
            }
        }
    }

    async fn fetch(&self, node: &Node) -> Result<Vec<RawMessage>, NodeError> {
        let last_hash = self.last_hash(node);
        let long_poll = matches!(self.config.strategy, PollStrategy::Long);
        self.network
            .retrieve(node, &self.identity, last_hash.as_deref(), long_poll)
            .await
    }

    /// One fetch against `node` and its accepted envelopes.
    pub(crate) async fn poll_once(&self, node: &Node) -> Result<Vec<Envelope>, NodeError> {
        let raw = self.fetch(node).await?;
        Ok(self.accept(node, raw))
    }

    fn last_hash(&self, node: &Node) -> Option<String> {
        let now = self.network.network_time_ms();
        let mut cursors = lock(&self.cursors);
        if cursors.get(node, &self.identity).is_none() {
            let key = records::cursor_key(node, &self.identity);
            match records::load::<CursorRecord>(self.network.kv_store().as_ref(), &key) {
                Ok(Some(record)) => cursors.insert(node.clone(), self.identity.clone(), record.cursor),
                Ok(None) => {}
                Err(e) => debug!(node = %node, error = %e, "ignoring persisted cursor"),
            }
        }
        cursors.last_hash(node, &self.identity, now)
    }

    /// Advance the cursor, drop already-seen hashes, decode the rest. Undecodable
    /// messages are skipped individually.
    fn accept(&self, node: &Node, raw: Vec<RawMessage>) -> Vec<Envelope> {
        if raw.is_empty() {
            return Vec::new();
        }
        let now = self.network.network_time_ms();
        let cursor = lock(&self.cursors).advance(node, &self.identity, &raw);
        if let Some(cursor) = cursor {
            self.network.persist(
                &records::cursor_key(node, &self.identity),
                &CursorRecord {
                    node: node.clone(),
                    cursor,
                },
            );
        }

        let (fresh, entries) = {
            let mut received = lock(&self.received);
            received.prune(now);
            let fresh = received.filter_new(&self.identity, raw, now);
            (fresh, received.entries(&self.identity))
        };
        if fresh.is_empty() {
            return Vec::new();
        }
        self.network.persist(
            &records::received_key(&self.identity),
            &ReceivedHashesRecord { entries },
        );

        fresh
            .into_iter()
            .filter_map(|m| match m.decode() {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(hash = %m.hash, error = %e, "dropping undecodable message");
                    None
                }
            })
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sleep unless stopped first. Returns true when stopped.
async fn pause(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        changed = stop.changed() => {
            if changed.is_err() {
                return true;
            }
        }
    }
    let stopped = *stop.borrow();
    stopped
}
