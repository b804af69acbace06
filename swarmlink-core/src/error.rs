//! Node error taxonomy and HTTP status classification.

use serde_json::Value;

use crate::codec::CodecError;
use crate::node::{parse_swarm_nodes, Node};
use crate::onion::OnionError;
use crate::pow::PowError;
use crate::store::StoreError;

/// Body prefix a relay returns when it cannot reach the next hop of an onion path.
pub const NEXT_NODE_NOT_FOUND: &str = "Next node not found: ";

/// Outcome of a failed node interaction.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Network or server hiccup (status 0 means no response at all).
    #[error("transient node error (status {status})")]
    Transient { status: u16 },
    #[error("clock out of sync with the network")]
    ClockSkew,
    /// The node no longer serves the identity. `replacement` is the swarm the node suggested, if any.
    #[error("node is not in the swarm for this identity")]
    SwarmMembership { replacement: Vec<Node> },
    #[error("proof of work difficulty too low")]
    ProofOfWorkTooLow { difficulty: Option<u64> },
    #[error("insufficient nodes")]
    InsufficientNodes,
    /// A relay could not reach the hop named by its ed25519 key.
    #[error("onion hop {ed25519} not found")]
    PathHopMissing { ed25519: String },
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("proof of work computation failed: {0}")]
    ProofOfWorkComputation(#[from] PowError),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("onion error: {0}")]
    Onion(#[from] OnionError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl NodeError {
    /// Transient errors count against the node and are retried elsewhere.
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Transient { .. })
    }

    /// Errors that must reach the caller and never be retried silently.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeError::ClockSkew
                | NodeError::InsufficientNodes
                | NodeError::ProofOfWorkComputation(_)
        )
    }
}

/// Classify an HTTP status and body. `None` for success.
pub fn classify_status(status: u16, body: &str) -> Option<NodeError> {
    if (200..300).contains(&status) {
        return None;
    }
    let err = match status {
        406 => NodeError::ClockSkew,
        421 => {
            let replacement = serde_json::from_str::<Value>(body)
                .map(|json| parse_swarm_nodes(&json))
                .unwrap_or_default();
            NodeError::SwarmMembership { replacement }
        }
        432 => {
            let difficulty = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|json| json.get("difficulty").and_then(Value::as_u64));
            NodeError::ProofOfWorkTooLow { difficulty }
        }
        _ => match body.strip_prefix(NEXT_NODE_NOT_FOUND) {
            Some(ed25519) => NodeError::PathHopMissing {
                ed25519: ed25519.trim().to_string(),
            },
            None => NodeError::Transient { status },
        },
    };
    Some(err)
}
