//! Storage RPC request bodies and response parsing.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

use crate::codec::{self, CodecError, Envelope};
use crate::node::{parse_seed_nodes, parse_swarm_nodes, Node};

/// Default message time to live: 24 hours in ms.
pub const DEFAULT_TTL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    GetSwarm,
    Retrieve,
    Store,
    /// Proxied daemon query; used to fetch a node's view of the service node list.
    OxendRequest,
}

impl RpcMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcMethod::GetSwarm => "get_snodes_for_pubkey",
            RpcMethod::Retrieve => "retrieve",
            RpcMethod::Store => "store",
            RpcMethod::OxendRequest => "oxend_request",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "get_snodes_for_pubkey" => RpcMethod::GetSwarm,
            "retrieve" => RpcMethod::Retrieve,
            "store" => RpcMethod::Store,
            "oxend_request" => RpcMethod::OxendRequest,
            _ => return None,
        })
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{"method": ..., "params": ...}`.
pub fn rpc_body(method: RpcMethod, params: Value) -> Value {
    json!({ "method": method.as_str(), "params": params })
}

/// Seed `json_rpc` body for `get_n_service_nodes`.
pub fn seed_request_body() -> Value {
    json!({
        "method": "get_n_service_nodes",
        "params": { "active_only": true, "fields": service_node_fields() },
    })
}

fn service_node_fields() -> Value {
    json!({
        "public_ip": true,
        "storage_port": true,
        "pubkey_ed25519": true,
        "pubkey_x25519": true,
    })
}

pub fn get_swarm_params(identity: &str) -> Value {
    json!({ "pubKey": identity })
}

/// Params asking a node for its view of the service node list.
pub fn service_nodes_params() -> Value {
    json!({
        "endpoint": "get_service_nodes",
        "params": { "active_only": true, "fields": service_node_fields() },
    })
}

/// Retrieve params. An absent cursor is sent as an empty `lastHash`.
pub fn retrieve_params(identity: &str, last_hash: Option<&str>) -> Value {
    json!({ "pubKey": identity, "lastHash": last_hash.unwrap_or("") })
}

/// A message composed for sending, before proof of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub destination: String,
    /// Wrapped envelope bytes.
    pub data: Vec<u8>,
    pub ttl_ms: u64,
}

impl OutgoingMessage {
    /// A zero or missing TTL falls back to [`DEFAULT_TTL_MS`].
    pub fn new(destination: impl Into<String>, data: Vec<u8>, ttl_ms: Option<u64>) -> Self {
        Self {
            destination: destination.into(),
            data,
            ttl_ms: ttl_ms.filter(|t| *t > 0).unwrap_or(DEFAULT_TTL_MS),
        }
    }

    pub fn encoded_data(&self) -> String {
        BASE64.encode(&self.data)
    }

    /// Attach a timestamp and proof of work nonce. The result is immutable.
    pub fn stamp(self, timestamp: u64, nonce: String) -> StampedMessage {
        StampedMessage {
            message: self,
            timestamp,
            nonce,
        }
    }
}

/// Message with proof of work attached, ready to store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedMessage {
    message: OutgoingMessage,
    timestamp: u64,
    nonce: String,
}

impl StampedMessage {
    pub fn message(&self) -> &OutgoingMessage {
        &self.message
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn store_params(&self) -> Value {
        json!({
            "pubKey": self.message.destination,
            "ttl": self.message.ttl_ms.to_string(),
            "timestamp": self.timestamp.to_string(),
            "data": self.message.encoded_data(),
            "nonce": self.nonce,
        })
    }
}

/// A message as returned by `retrieve`, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub hash: String,
    /// Unix ms; 0 when the node did not say.
    pub expiration: u64,
    /// Base64 of the wrapped envelope.
    pub data: String,
}

impl RawMessage {
    pub fn decode(&self) -> Result<Envelope, CodecError> {
        let bytes = BASE64.decode(self.data.as_bytes())?;
        codec::unwrap(&bytes)
    }
}

/// Messages of a `retrieve` response in node order. Entries without hash or data are skipped.
pub fn parse_messages(json: &Value) -> Vec<RawMessage> {
    let Some(messages) = json.get("messages").and_then(Value::as_array) else {
        return Vec::new();
    };
    messages
        .iter()
        .filter_map(|m| {
            let hash = m.get("hash")?.as_str()?.to_string();
            let data = m.get("data")?.as_str()?.to_string();
            let expiration = match m.get("expiration") {
                Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
                Some(Value::String(s)) => s.parse().unwrap_or(0),
                _ => 0,
            };
            Some(RawMessage {
                hash,
                expiration,
                data,
            })
        })
        .collect()
}

/// Node list in either the seed (`result.service_node_states`) or swarm (`snodes`) shape.
pub fn parse_nodes(json: &Value) -> Vec<Node> {
    if json.get("snodes").is_some() {
        parse_swarm_nodes(json)
    } else {
        parse_seed_nodes(json)
    }
}

/// Difficulty a node suggests in a store response or a 432 body.
pub fn suggested_difficulty(json: &Value) -> Option<u64> {
    json.get("difficulty").and_then(Value::as_u64)
}

/// Server clock in ms (`t`), when present.
pub fn server_timestamp(json: &Value) -> Option<u64> {
    let t = json.get("t").and_then(Value::as_u64);
    if t.is_some() {
        debug!(server_ms = t, "server timestamp in response");
    }
    t
}
