//! Storage nodes, onion paths, and parsing of the node lists nodes and seeds return.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::identity::PublicKey;

/// Scheme prepended to bare IPs received from the network.
pub const NODE_SCHEME: &str = "https://";

/// Node public keys: ed25519 names the node on the network, x25519 encrypts onion layers to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    pub ed25519: String,
    pub x25519: String,
}

impl KeySet {
    pub fn encryption_key(&self) -> Option<PublicKey> {
        PublicKey::from_hex(&self.x25519).ok()
    }
}

/// A storage node. Equality and hashing use (address, port) only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Scheme and host, e.g. `https://10.0.0.1`.
    pub address: String,
    pub port: u16,
    pub keys: Option<KeySet>,
}

impl Node {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            keys: None,
        }
    }

    pub fn with_keys(mut self, keys: KeySet) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Base URL (`scheme://host:port`).
    pub fn url(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn ed25519(&self) -> Option<&str> {
        self.keys.as_ref().map(|k| k.ed25519.as_str())
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A three hop onion path: guard first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path {
    pub guard: Node,
    pub hop1: Node,
    pub hop2: Node,
}

impl Path {
    pub fn new(guard: Node, hop1: Node, hop2: Node) -> Self {
        Self { guard, hop1, hop2 }
    }

    pub fn nodes(&self) -> [&Node; 3] {
        [&self.guard, &self.hop1, &self.hop2]
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.nodes().iter().any(|n| *n == node)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} -> {}", self.guard, self.hop1, self.hop2)
    }
}

/// Parse the seed `get_n_service_nodes` response (`result.service_node_states`).
pub fn parse_seed_nodes(json: &Value) -> Vec<Node> {
    let Some(states) = json
        .get("result")
        .and_then(|r| r.get("service_node_states"))
        .and_then(Value::as_array)
    else {
        warn!("seed response is missing service_node_states");
        return Vec::new();
    };
    states
        .iter()
        .filter_map(|s| parse_node_entry(s, "public_ip", "storage_port"))
        .collect()
}

/// Parse a swarm list (`snodes`), as returned by `get_snodes_for_pubkey` and by 421 responses.
pub fn parse_swarm_nodes(json: &Value) -> Vec<Node> {
    let Some(entries) = json.get("snodes").and_then(Value::as_array) else {
        warn!("response is missing snodes");
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|s| parse_node_entry(s, "ip", "port"))
        .collect()
}

/// Best effort: entries with a missing or unroutable IP, or a bad port, are skipped.
fn parse_node_entry(entry: &Value, ip_field: &str, port_field: &str) -> Option<Node> {
    let ip = entry.get(ip_field)?.as_str()?;
    if ip.is_empty() || ip == "0.0.0.0" {
        return None;
    }
    // Ports arrive as numbers from seeds and as strings from storage nodes.
    let port = match entry.get(port_field)? {
        Value::Number(n) => u16::try_from(n.as_u64()?).ok()?,
        Value::String(s) => s.parse::<u16>().ok()?,
        _ => return None,
    };
    let address = if ip.contains("://") {
        ip.to_string()
    } else {
        format!("{}{}", NODE_SCHEME, ip)
    };
    let mut node = Node::new(address, port);
    if let (Some(ed), Some(x)) = (
        entry.get("pubkey_ed25519").and_then(Value::as_str),
        entry.get("pubkey_x25519").and_then(Value::as_str),
    ) {
        node.keys = Some(KeySet {
            ed25519: ed.to_string(),
            x25519: x.to_string(),
        });
    }
    Some(node)
}
