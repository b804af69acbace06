//! Send pipeline: compose, proof of work, concurrent replication to the destination's swarm.

use std::fmt;
use std::sync::Arc;

use swarmlink_core::pow::{self, PowError};
use swarmlink_core::{codec, Envelope, Node, NodeError, OutgoingMessage, StampedMessage};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::network::Network;

pub const DEFAULT_STORE_RETRIES: usize = 4;

/// How many target nodes must store a message for the send to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quorum {
    #[default]
    All,
    Majority,
    AtLeast(usize),
}

impl Quorum {
    /// Required stores for `targets` nodes, never more than the targets available.
    pub fn required(self, targets: usize) -> usize {
        let n = match self {
            Quorum::All => targets,
            Quorum::Majority => targets / 2 + 1,
            Quorum::AtLeast(k) => k.max(1),
        };
        n.min(targets)
    }
}

#[derive(Debug, Clone)]
pub struct SendConfig {
    pub quorum: Quorum,
    /// Attempts per target node for transient failures.
    pub retries_per_node: usize,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            quorum: Quorum::All,
            retries_per_node: DEFAULT_STORE_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Succeeded { stored: usize, targets: usize },
    /// Some nodes stored the message but fewer than the quorum.
    PartiallyFailed { stored: usize, targets: usize },
    Failed { targets: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Composed,
    ProofOfWorkPending,
    ProofOfWorkDone,
    Replicating,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl fmt::Display for SendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SendState::Composed => "composed",
            SendState::ProofOfWorkPending => "pow_pending",
            SendState::ProofOfWorkDone => "pow_done",
            SendState::Replicating => "replicating",
            SendState::Succeeded => "succeeded",
            SendState::PartiallyFailed => "partially_failed",
            SendState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Clone)]
pub struct SendPipeline {
    network: Network,
    config: SendConfig,
}

impl SendPipeline {
    pub fn new(network: Network, config: SendConfig) -> Self {
        Self { network, config }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Wrap `envelope` for `destination`. A missing or zero TTL uses the default.
    pub fn compose(
        &self,
        destination: &str,
        envelope: &Envelope,
        ttl_ms: Option<u64>,
    ) -> Result<OutgoingMessage, NodeError> {
        let data = codec::wrap(envelope, envelope.timestamp)?;
        Ok(OutgoingMessage::new(destination, data, ttl_ms))
    }

    /// Stamp with proof of work and replicate. Clock skew, proof of work failures and a
    /// too-small swarm are errors; node failures are reflected in the outcome.
    pub async fn send(&self, message: OutgoingMessage) -> Result<SendOutcome, NodeError> {
        let destination = message.destination.clone();
        let mut state = SendState::Composed;
        let mut advance = |next: SendState| {
            debug!(destination = %destination, from = %state, to = %next, "send state");
            state = next;
        };

        advance(SendState::ProofOfWorkPending);
        let timestamp = self.network.network_time_ms();
        let difficulty = self.network.difficulty().get();
        let for_pow = message.clone();
        let nonce = tokio::task::spawn_blocking(move || pow::calculate(&for_pow, timestamp, difficulty))
            .await
            .map_err(|_| PowError::Aborted)??;
        advance(SendState::ProofOfWorkDone);
        let stamped = Arc::new(message.stamp(timestamp, nonce));

        let targets = self.network.get_target_nodes(&stamped.message().destination).await?;
        advance(SendState::Replicating);
        let required = self.config.quorum.required(targets.len());
        let mut stores = JoinSet::new();
        for node in targets.iter().cloned() {
            let network = self.network.clone();
            let stamped = stamped.clone();
            let attempts = self.config.retries_per_node;
            stores.spawn(async move { store_with_retries(network, node, stamped, attempts).await });
        }

        let mut stored = 0;
        while let Some(joined) = stores.join_next().await {
            match joined {
                Ok(Ok(())) => stored += 1,
                Ok(Err(e)) if e.is_terminal() => {
                    advance(SendState::Failed);
                    return Err(e);
                }
                Ok(Err(e)) => debug!(error = %e, "store failed on target"),
                Err(e) => warn!(error = %e, "store task failed"),
            }
            if stored >= required {
                // Remaining stores finish in the background.
                stores.detach_all();
                break;
            }
        }

        let outcome = if stored >= required && stored > 0 {
            advance(SendState::Succeeded);
            SendOutcome::Succeeded {
                stored,
                targets: targets.len(),
            }
        } else if stored > 0 {
            advance(SendState::PartiallyFailed);
            SendOutcome::PartiallyFailed {
                stored,
                targets: targets.len(),
            }
        } else {
            advance(SendState::Failed);
            SendOutcome::Failed {
                targets: targets.len(),
            }
        };
        info!(destination = %stamped.message().destination, ?outcome, "send finished");
        Ok(outcome)
    }
}

async fn store_with_retries(
    network: Network,
    node: Node,
    stamped: Arc<StampedMessage>,
    attempts: usize,
) -> Result<(), NodeError> {
    let mut last = NodeError::Transient { status: 0 };
    for attempt in 1..=attempts.max(1) {
        match network.store(&node, &stamped).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_transient() || matches!(e, NodeError::PathHopMissing { .. }) => {
                debug!(node = %node, attempt, error = %e, "store attempt failed");
                last = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}
