//! Envelope wire format: bincode envelope inside a bincode request container, the same
//! bytes whether the message travels through a swarm or directly to a peer.

use serde::{Deserialize, Serialize};

/// Virtual path every wrapped envelope is addressed to.
pub const MESSAGE_PATH: &str = "/api/v1/message";
const MESSAGE_VERB: &str = "PUT";
const MAX_CONTAINER_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Ciphertext,
    PrekeyBundle,
    FriendRequest,
    UnidentifiedSender,
    ClosedGroupCiphertext,
    /// Presence ping or reply carrying an [`AddressMessage`].
    Address,
}

impl EnvelopeKind {
    fn to_wire(self) -> u8 {
        match self {
            EnvelopeKind::Ciphertext => 1,
            EnvelopeKind::PrekeyBundle => 3,
            EnvelopeKind::FriendRequest => 101,
            EnvelopeKind::UnidentifiedSender => 6,
            EnvelopeKind::ClosedGroupCiphertext => 7,
            EnvelopeKind::Address => 102,
        }
    }

    fn from_wire(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            1 => EnvelopeKind::Ciphertext,
            3 => EnvelopeKind::PrekeyBundle,
            101 => EnvelopeKind::FriendRequest,
            6 => EnvelopeKind::UnidentifiedSender,
            7 => EnvelopeKind::ClosedGroupCiphertext,
            102 => EnvelopeKind::Address,
            other => return Err(CodecError::UnknownKind(other)),
        })
    }
}

/// Application envelope. `content` is opaque (already encrypted by the caller).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub source: String,
    pub source_device: u32,
    pub content: Vec<u8>,
    /// Unix ms.
    pub timestamp: u64,
}

impl Envelope {
    /// Presence envelope from `source` advertising `address`.
    pub fn address(source: impl Into<String>, address: &AddressMessage, timestamp: u64) -> Result<Self, CodecError> {
        Ok(Self {
            kind: EnvelopeKind::Address,
            source: source.into(),
            source_device: 1,
            content: address.encode()?,
            timestamp,
        })
    }

    /// Decode the `AddressMessage` of an `Address` envelope.
    pub fn address_message(&self) -> Option<AddressMessage> {
        if self.kind != EnvelopeKind::Address {
            return None;
        }
        AddressMessage::decode(&self.content).ok()
    }
}

/// Advertised direct address of a peer. `is_ping` asks the receiver to answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMessage {
    /// Scheme and host, e.g. `http://192.168.1.4`.
    pub address: String,
    pub port: u16,
    pub is_ping: bool,
}

impl AddressMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(CodecError::Envelope)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(CodecError::Envelope)
    }
}

/// On-wire envelope: every field optional so that missing fields are reported, not panicked on.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    kind: Option<u8>,
    source: Option<String>,
    source_device: Option<u32>,
    content: Option<Vec<u8>>,
    timestamp: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct RequestContainer {
    id: u64,
    verb: String,
    path: String,
    body: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("container decode error: {0}")]
    Container(#[source] bincode::Error),
    #[error("envelope decode error: {0}")]
    Envelope(#[source] bincode::Error),
    #[error("container addressed to {0}")]
    WrongPath(String),
    #[error("missing envelope field {0}")]
    MissingField(&'static str),
    #[error("unknown envelope kind {0}")]
    UnknownKind(u8),
    #[error("container too large")]
    TooLarge,
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Serialize an envelope inside a request container. Deterministic: the timestamp doubles
/// as the container id.
pub fn wrap(envelope: &Envelope, timestamp: u64) -> Result<Vec<u8>, CodecError> {
    let wire = WireEnvelope {
        kind: Some(envelope.kind.to_wire()),
        source: Some(envelope.source.clone()),
        source_device: Some(envelope.source_device),
        content: Some(envelope.content.clone()),
        timestamp: Some(timestamp),
    };
    let body = bincode::serialize(&wire).map_err(CodecError::Envelope)?;
    let container = RequestContainer {
        id: timestamp,
        verb: MESSAGE_VERB.to_string(),
        path: MESSAGE_PATH.to_string(),
        body,
    };
    let out = bincode::serialize(&container).map_err(CodecError::Container)?;
    if out.len() > MAX_CONTAINER_LEN {
        return Err(CodecError::TooLarge);
    }
    Ok(out)
}

/// Inverse of [`wrap`]. Type and content are required; the rest default when absent.
pub fn unwrap(bytes: &[u8]) -> Result<Envelope, CodecError> {
    if bytes.len() > MAX_CONTAINER_LEN {
        return Err(CodecError::TooLarge);
    }
    let container: RequestContainer = bincode::deserialize(bytes).map_err(CodecError::Container)?;
    if container.path != MESSAGE_PATH {
        return Err(CodecError::WrongPath(container.path));
    }
    let wire: WireEnvelope =
        bincode::deserialize(&container.body).map_err(CodecError::Envelope)?;
    let kind = wire.kind.ok_or(CodecError::MissingField("kind"))?;
    let content = wire.content.ok_or(CodecError::MissingField("content"))?;
    Ok(Envelope {
        kind: EnvelopeKind::from_wire(kind)?,
        source: wire.source.unwrap_or_default(),
        source_device: wire.source_device.unwrap_or(1),
        content,
        timestamp: wire.timestamp.unwrap_or(container.id),
    })
}
