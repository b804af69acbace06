//! Onion layering: one ephemeral X25519 + ChaCha20-Poly1305 layer per hop.
//!
//! Every hop receives a blob `[len: u32 LE][ciphertext][json]`. The json names the
//! ephemeral key the ciphertext was sealed with. Decrypting yields either another blob
//! whose json also names the next `destination`, or the final payload. The destination
//! answers with `{"result": base64(nonce || ciphertext)}` sealed under the key derived
//! for the innermost layer.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::identity::{self, CryptoError, Keypair, PublicKey};
use crate::node::{KeySet, Node, Path};

const LEN_SIZE: usize = 4;
const MAX_BLOB_LEN: usize = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum OnionError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("node {0} has no keys")]
    MissingKeys(String),
    #[error("malformed onion blob: {0}")]
    Malformed(&'static str),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Onion ready to post to the guard.
pub struct OnionRequest {
    pub guard: Node,
    pub body: Vec<u8>,
    /// Key shared with the destination, used to open its response.
    pub destination_key: [u8; 32],
}

/// One layer removed by a hop.
#[derive(Debug)]
pub enum Layer {
    /// Forward `ciphertext` to the node named `destination` (ed25519 hex).
    Relay {
        destination: String,
        ephemeral_key: PublicKey,
        ciphertext: Vec<u8>,
    },
    Final { payload: Vec<u8> },
}

#[derive(Debug)]
pub struct Peeled {
    pub layer: Layer,
    /// Key the hop shares with the sender; the destination seals its response with it.
    pub symmetric_key: [u8; 32],
}

/// Decrypted destination response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnionResponse {
    pub status: u16,
    pub body: String,
}

/// Payload the destination storage node receives: the RPC body plus HTTP headers to apply.
pub fn destination_payload(rpc_body: &Value, headers: &[(&str, &str)]) -> Vec<u8> {
    let headers: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect();
    json!({ "body": rpc_body.to_string(), "headers": headers })
        .to_string()
        .into_bytes()
}

fn encode_blob(ciphertext: &[u8], json: &Value) -> Vec<u8> {
    let json = json.to_string();
    let mut out = Vec::with_capacity(LEN_SIZE + ciphertext.len() + json.len());
    out.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
    out.extend_from_slice(ciphertext);
    out.extend_from_slice(json.as_bytes());
    out
}

fn decode_blob(bytes: &[u8]) -> Result<(&[u8], Value), OnionError> {
    if bytes.len() < LEN_SIZE {
        return Err(OnionError::Malformed("too short"));
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_BLOB_LEN || bytes.len() < LEN_SIZE + len {
        return Err(OnionError::Malformed("bad length"));
    }
    let ciphertext = &bytes[LEN_SIZE..LEN_SIZE + len];
    let json = serde_json::from_slice(&bytes[LEN_SIZE + len..])?;
    Ok((ciphertext, json))
}

fn hop_keys(node: &Node) -> Result<(&KeySet, PublicKey), OnionError> {
    let keys = node
        .keys
        .as_ref()
        .ok_or_else(|| OnionError::MissingKeys(node.to_string()))?;
    let key = keys
        .encryption_key()
        .ok_or_else(|| OnionError::MissingKeys(node.to_string()))?;
    Ok((keys, key))
}

/// Layer `payload` for `destination` through `path`, innermost layer first.
pub fn build_onion(payload: &[u8], destination: &Node, path: &Path) -> Result<OnionRequest, OnionError> {
    let (dest_keys, dest_key) = hop_keys(destination)?;
    let inner = identity::encrypt_for(&dest_key, payload)?;
    let destination_key = inner.symmetric_key;

    let mut ciphertext = inner.ciphertext;
    let mut ephemeral = inner.ephemeral_public;
    let mut next_ed25519 = dest_keys.ed25519.clone();
    for hop in [&path.hop2, &path.hop1, &path.guard] {
        let (hop_keyset, hop_key) = hop_keys(hop)?;
        let plaintext = encode_blob(
            &ciphertext,
            &json!({ "destination": next_ed25519, "ephemeral_key": ephemeral.to_hex() }),
        );
        let sealed = identity::encrypt_for(&hop_key, &plaintext)?;
        ciphertext = sealed.ciphertext;
        ephemeral = sealed.ephemeral_public;
        next_ed25519 = hop_keyset.ed25519.clone();
    }

    Ok(OnionRequest {
        guard: path.guard.clone(),
        body: forward_blob(&ciphertext, &ephemeral),
        destination_key,
    })
}

/// Blob a relay sends to the next hop.
pub fn forward_blob(ciphertext: &[u8], ephemeral_key: &PublicKey) -> Vec<u8> {
    encode_blob(ciphertext, &json!({ "ephemeral_key": ephemeral_key.to_hex() }))
}

/// Remove one layer with the hop's keypair.
pub fn peel_layer(keypair: &Keypair, blob: &[u8]) -> Result<Peeled, OnionError> {
    let (ciphertext, json) = decode_blob(blob)?;
    let ephemeral = json
        .get("ephemeral_key")
        .and_then(Value::as_str)
        .ok_or(OnionError::Malformed("missing ephemeral_key"))?;
    let ephemeral = PublicKey::from_hex(ephemeral)?;
    let (plaintext, symmetric_key) = identity::decrypt_from(keypair, &ephemeral, ciphertext)?;

    // An inner blob naming a destination means this hop is a relay.
    if let Ok((inner_ct, inner_json)) = decode_blob(&plaintext) {
        if let (Some(destination), Some(eph)) = (
            inner_json.get("destination").and_then(Value::as_str),
            inner_json.get("ephemeral_key").and_then(Value::as_str),
        ) {
            return Ok(Peeled {
                layer: Layer::Relay {
                    destination: destination.to_string(),
                    ephemeral_key: PublicKey::from_hex(eph)?,
                    ciphertext: inner_ct.to_vec(),
                },
                symmetric_key,
            });
        }
    }
    Ok(Peeled {
        layer: Layer::Final { payload: plaintext },
        symmetric_key,
    })
}

/// Destination side: seal a status and body for the sender.
pub fn seal_response(key: &[u8; 32], status: u16, body: &str) -> Result<String, OnionError> {
    let plaintext = serde_json::to_vec(&OnionResponse {
        status,
        body: body.to_string(),
    })?;
    let sealed = identity::seal(key, &plaintext)?;
    Ok(json!({ "result": BASE64.encode(sealed) }).to_string())
}

/// Open a destination response. Accepts `{"result": "<b64>"}` or the bare base64 text.
pub fn decrypt_response(key: &[u8; 32], response: &str) -> Result<OnionResponse, OnionError> {
    let encoded = match serde_json::from_str::<Value>(response) {
        Ok(Value::Object(map)) => map
            .get("result")
            .and_then(Value::as_str)
            .ok_or(OnionError::Malformed("missing result"))?
            .to_string(),
        _ => response.trim().to_string(),
    };
    let sealed = BASE64.decode(encoded.as_bytes())?;
    let plaintext = identity::open(key, &sealed)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Hop {
        keypair: Keypair,
        node: Node,
    }

    fn hop(i: u16) -> Hop {
        let keypair = Keypair::generate();
        let node = Node::new(format!("https://10.2.0.{i}"), 443).with_keys(KeySet {
            ed25519: format!("ed{i}"),
            x25519: keypair.public_key().to_hex(),
        });
        Hop { keypair, node }
    }

    #[test]
    fn layers_peel_in_path_order() {
        let (guard, h1, h2, dest) = (hop(1), hop(2), hop(3), hop(4));
        let path = Path::new(guard.node.clone(), h1.node.clone(), h2.node.clone());
        let payload = destination_payload(&json!({"method": "retrieve"}), &[("X-Loki-Long-Poll", "true")]);
        let onion = build_onion(&payload, &dest.node, &path).unwrap();
        assert_eq!(onion.guard, guard.node);

        let mut blob = onion.body;
        let mut expected = ["ed2", "ed3", "ed4"].into_iter();
        for relay in [&guard, &h1, &h2] {
            let peeled = peel_layer(&relay.keypair, &blob).unwrap();
            match peeled.layer {
                Layer::Relay {
                    destination,
                    ephemeral_key,
                    ciphertext,
                } => {
                    assert_eq!(destination, expected.next().unwrap());
                    blob = forward_blob(&ciphertext, &ephemeral_key);
                }
                Layer::Final { .. } => panic!("relay saw final layer"),
            }
        }

        let last = peel_layer(&dest.keypair, &blob).unwrap();
        assert_eq!(last.symmetric_key, onion.destination_key);
        match last.layer {
            Layer::Final { payload: got } => assert_eq!(got, payload),
            Layer::Relay { .. } => panic!("destination saw relay layer"),
        }

        let sealed = seal_response(&last.symmetric_key, 200, r#"{"t":5}"#).unwrap();
        let response = decrypt_response(&onion.destination_key, &sealed).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, r#"{"t":5}"#);
    }

    #[test]
    fn wrong_hop_cannot_peel() {
        let (guard, h1, h2, dest) = (hop(1), hop(2), hop(3), hop(4));
        let path = Path::new(guard.node, h1.node, h2.node.clone());
        let onion = build_onion(b"x", &dest.node, &path).unwrap();
        assert!(peel_layer(&h2.keypair, &onion.body).is_err());
    }

    #[test]
    fn missing_keys_rejected() {
        let (guard, h1, dest) = (hop(1), hop(2), hop(4));
        let keyless = Node::new("https://10.2.0.9", 443);
        let path = Path::new(guard.node, h1.node, keyless);
        assert!(matches!(
            build_onion(b"x", &dest.node, &path),
            Err(OnionError::MissingKeys(_))
        ));
    }

    #[test]
    fn bare_base64_response_accepted() {
        let key = [3u8; 32];
        let sealed = identity::seal(&key, br#"{"status":421,"body":""}"#).unwrap();
        let response = decrypt_response(&key, &BASE64.encode(sealed)).unwrap();
        assert_eq!(response.status, 421);
        assert!(decrypt_response(&key, r#"{"error":1}"#).is_err());
    }

    #[test]
    fn truncated_blob_rejected() {
        assert!(matches!(
            peel_layer(&Keypair::generate(), &[1, 0]),
            Err(OnionError::Malformed(_))
        ));
    }
}
