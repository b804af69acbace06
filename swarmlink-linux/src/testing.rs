//! In-process fake storage nodes and seeds for tests.
//!
//! Each fake listens on its own localhost port, answers `/storage_rpc/v1` and `/json_rpc`
//! through a script, and records every call. Fakes sharing a [`Keyring`] can also act as
//! onion guards: the guard peels every layer locally using the keyring and runs the script
//! for the final hop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use serde_json::{json, Value};
use swarmlink_core::identity::Keypair;
use swarmlink_core::onion::{self, Layer};
use swarmlink_core::{KeySet, Node};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::p2p::{read_http_request, write_http_response};

/// A recorded RPC.
#[derive(Debug, Clone)]
pub struct Call {
    /// HTTP path the call arrived on (`/storage_rpc/v1`, `/json_rpc` or `/onion_req/v2`).
    pub path: String,
    pub method: String,
    pub params: Value,
    /// Headers; for onion calls, the headers of the destination payload.
    pub headers: Vec<(String, String)>,
}

impl Call {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub type Script = Arc<dyn Fn(&Call) -> (u16, String) + Send + Sync>;

/// Fakes by ed25519 label, shared by fakes that relay onions for each other.
#[derive(Clone, Default)]
pub struct Keyring(Arc<Mutex<HashMap<String, Route>>>);

#[derive(Clone)]
struct Route {
    keypair: Arc<Keypair>,
    script: Script,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Keyring {
    fn insert(&self, ed25519: String, route: Route) {
        if let Ok(mut map) = self.0.lock() {
            map.insert(ed25519, route);
        }
    }

    fn get(&self, ed25519: &str) -> Option<Route> {
        self.0.lock().ok()?.get(ed25519).cloned()
    }
}

pub struct FakeNode {
    node: Node,
    calls: Arc<Mutex<Vec<Call>>>,
    task: JoinHandle<()>,
}

impl FakeNode {
    pub async fn spawn<F>(script: F) -> FakeNode
    where
        F: Fn(&Call) -> (u16, String) + Send + Sync + 'static,
    {
        Self::spawn_with_keyring(&Keyring::default(), script).await
    }

    pub async fn spawn_with_keyring<F>(keyring: &Keyring, script: F) -> FakeNode
    where
        F: Fn(&Call) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake node");
        let port = listener.local_addr().expect("local addr").port();
        let keypair = Arc::new(Keypair::generate());
        let mut label = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut label);
        let ed25519 = hex::encode(label);
        let node = Node::new("http://127.0.0.1", port).with_keys(KeySet {
            ed25519: ed25519.clone(),
            x25519: keypair.public_key().to_hex(),
        });
        let calls = Arc::new(Mutex::new(Vec::new()));
        let script: Script = Arc::new(script);
        keyring.insert(
            ed25519.clone(),
            Route {
                keypair,
                script: script.clone(),
                calls: calls.clone(),
            },
        );

        let server = Server {
            ed25519,
            keyring: keyring.clone(),
            script,
            calls: calls.clone(),
        };
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let server = server.clone();
                tokio::spawn(async move {
                    let _ = server.handle(stream).await;
                });
            }
        });
        FakeNode { node, calls, task }
    }

    pub fn node(&self) -> Node {
        self.node.clone()
    }

    /// Base URL, usable as a seed address.
    pub fn url(&self) -> String {
        self.node.url()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| c.method == method).count()
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone)]
struct Server {
    ed25519: String,
    keyring: Keyring,
    script: Script,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Server {
    async fn handle(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let Some(request) = read_http_request(&mut stream).await? else {
            return Ok(());
        };
        let (status, body) = if request.path.starts_with("/onion_req") {
            self.relay(&request.body)
        } else {
            let json: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
            let call = Call {
                path: request.path.clone(),
                method: json["method"].as_str().unwrap_or("").to_string(),
                params: json["params"].clone(),
                headers: request.headers.clone(),
            };
            run(&self.script, &self.calls, call)
        };
        write_http_response(&mut stream, status, body.as_bytes()).await
    }

    /// Peel every layer as the path would, then answer as the destination.
    fn relay(&self, blob: &[u8]) -> (u16, String) {
        let Some(mut route) = self.keyring.get(&self.ed25519) else {
            return (500, "fake not registered".to_string());
        };
        let mut blob = blob.to_vec();
        loop {
            let peeled = match onion::peel_layer(&route.keypair, &blob) {
                Ok(p) => p,
                Err(e) => return (400, e.to_string()),
            };
            match peeled.layer {
                Layer::Relay {
                    destination,
                    ephemeral_key,
                    ciphertext,
                } => {
                    let Some(next) = self.keyring.get(&destination) else {
                        return (502, format!("Next node not found: {destination}"));
                    };
                    route = next;
                    blob = onion::forward_blob(&ciphertext, &ephemeral_key);
                }
                Layer::Final { payload } => {
                    let outer: Value = serde_json::from_slice(&payload).unwrap_or(Value::Null);
                    let inner: Value = outer["body"]
                        .as_str()
                        .and_then(|b| serde_json::from_str(b).ok())
                        .unwrap_or(Value::Null);
                    let headers = outer["headers"]
                        .as_object()
                        .map(|h| {
                            h.iter()
                                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or("").to_string()))
                                .collect()
                        })
                        .unwrap_or_default();
                    let call = Call {
                        path: "/onion_req/v2".to_string(),
                        method: inner["method"].as_str().unwrap_or("").to_string(),
                        params: inner["params"].clone(),
                        headers,
                    };
                    let (status, body) = run(&route.script, &route.calls, call);
                    return match onion::seal_response(&peeled.symmetric_key, status, &body) {
                        Ok(sealed) => (200, sealed),
                        Err(e) => (500, e.to_string()),
                    };
                }
            }
        }
    }
}

fn run(script: &Script, calls: &Arc<Mutex<Vec<Call>>>, call: Call) -> (u16, String) {
    let response = script(&call);
    if let Ok(mut c) = calls.lock() {
        c.push(call);
    }
    response
}

/// `200` with a JSON body.
pub fn ok(body: Value) -> (u16, String) {
    (200, body.to_string())
}

/// Swarm list body in the `snodes` shape.
pub fn swarm_body(nodes: &[Node]) -> Value {
    json!({
        "snodes": nodes.iter().map(node_entry).collect::<Vec<_>>()
    })
}

/// Seed `get_n_service_nodes` body.
pub fn seed_body(nodes: &[Node]) -> Value {
    let states: Vec<Value> = nodes
        .iter()
        .map(|n| {
            let mut entry = node_entry(n);
            entry["public_ip"] = entry["ip"].take();
            entry["storage_port"] = json!(n.port);
            entry
        })
        .collect();
    json!({ "result": { "service_node_states": states } })
}

fn node_entry(n: &Node) -> Value {
    let mut entry = json!({ "ip": n.address, "port": n.port.to_string() });
    if let Some(keys) = &n.keys {
        entry["pubkey_ed25519"] = json!(keys.ed25519);
        entry["pubkey_x25519"] = json!(keys.x25519);
    }
    entry
}

/// A keyed node nothing listens on and no keyring knows; relays report it as not found.
pub fn ghost_node() -> Node {
    static NEXT_PORT: AtomicU16 = AtomicU16::new(30_000);
    let mut label = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut label);
    Node::new("http://127.0.0.2", NEXT_PORT.fetch_add(1, Ordering::Relaxed)).with_keys(KeySet {
        ed25519: hex::encode(label),
        x25519: Keypair::generate().public_key().to_hex(),
    })
}

/// Placeholder nodes nothing listens on; connections are refused immediately.
pub fn offline_nodes(count: u16) -> Vec<Node> {
    (0..count)
        .map(|i| Node::new("http://127.0.0.2", 20_000 + i))
        .collect()
}
