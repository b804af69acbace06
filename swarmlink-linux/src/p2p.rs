//! Direct peer-to-peer delivery: an HTTP listener that accepts `store` bodies from contacts,
//! and the client side that posts envelopes straight to a contact's advertised address.

use std::net::SocketAddr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use swarmlink_core::message::{rpc_body, RpcMethod, DEFAULT_TTL_MS};
use swarmlink_core::{classify_status, codec, CodecError, Envelope, EnvelopeKind, NodeError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::presence::PresenceManager;

/// Path storage nodes and peers accept RPC bodies on.
pub const RPC_PATH: &str = "/storage_rpc/v1";
const MAX_REQUEST_LEN: usize = 16 * 1024 * 1024;
const READ_CHUNK: usize = 8192;

/// A parsed HTTP/1.1 request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read one request (headers plus Content-Length body). `None` if the peer closed first.
pub(crate) async fn read_http_request(stream: &mut TcpStream) -> std::io::Result<Option<HttpRequest>> {
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];
    let (head_len, method, path, headers) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        let mut raw_headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut raw_headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => {
                let method = req.method.unwrap_or("").to_string();
                let path = req.path.unwrap_or("").to_string();
                let headers: Vec<(String, String)> = req
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).trim().to_string(),
                        )
                    })
                    .collect();
                break (len, method, path, headers);
            }
            Ok(httparse::Status::Partial) if buf.len() < MAX_REQUEST_LEN => continue,
            Ok(httparse::Status::Partial) => {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "headers too large"))
            }
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        }
    };
    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_REQUEST_LEN {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "body too large"));
    }
    let mut body = buf.split_off(head_len);
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Ok(Some(HttpRequest {
        method,
        path,
        headers,
        body,
    }))
}

pub(crate) async fn write_http_response(stream: &mut TcpStream, status: u16, body: &[u8]) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Status",
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

#[derive(Debug, thiserror::Error)]
pub enum P2pError {
    #[error("not a store request")]
    NotStore,
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing data")]
    MissingData,
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Envelope carried by a `store` RPC body.
pub fn decode_store_body(body: &[u8]) -> Result<Envelope, P2pError> {
    let json: Value = serde_json::from_slice(body)?;
    if json.get("method").and_then(Value::as_str) != Some(RpcMethod::Store.as_str()) {
        return Err(P2pError::NotStore);
    }
    let data = json
        .get("params")
        .and_then(|p| p.get("data"))
        .and_then(Value::as_str)
        .ok_or(P2pError::MissingData)?;
    let bytes = BASE64.decode(data.as_bytes()).map_err(CodecError::from)?;
    Ok(codec::unwrap(&bytes)?)
}

/// Bind the P2P listener on all interfaces.
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "p2p listener bound");
    Ok(listener)
}

/// Accept connections until the listener fails. Address envelopes go to `presence`,
/// everything else to `sink`.
pub async fn serve(
    listener: TcpListener,
    sink: mpsc::Sender<Envelope>,
    presence: Option<PresenceManager>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let sink = sink.clone();
        let presence = presence.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, sink, presence).await {
                debug!(%peer, error = %e, "p2p connection failed");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    sink: mpsc::Sender<Envelope>,
    presence: Option<PresenceManager>,
) -> std::io::Result<()> {
    let Some(request) = read_http_request(&mut stream).await? else {
        return Ok(());
    };
    if !request.method.eq_ignore_ascii_case("POST") || request.path != RPC_PATH {
        return write_http_response(&mut stream, 404, b"{}").await;
    }
    let envelope = match decode_store_body(&request.body) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "rejecting p2p message");
            return write_http_response(&mut stream, 400, b"{}").await;
        }
    };
    write_http_response(&mut stream, 200, b"{}").await?;

    match (envelope.kind, envelope.address_message(), presence) {
        (EnvelopeKind::Address, Some(address), Some(presence)) => {
            presence
                .on_address_message(&envelope.source, &address, true)
                .await;
        }
        (EnvelopeKind::Address, _, _) => {
            debug!(source = %envelope.source, "address message ignored");
        }
        _ => {
            debug!(source = %envelope.source, "p2p message received");
            if sink.send(envelope).await.is_err() {
                warn!("message sink closed");
            }
        }
    }
    Ok(())
}

/// POST `envelope` straight to a contact's advertised `{address}:{port}`.
pub async fn send_direct(
    client: &reqwest::Client,
    address: &str,
    port: u16,
    recipient: &str,
    envelope: &Envelope,
    timeout: Duration,
) -> Result<(), NodeError> {
    let wrapped = codec::wrap(envelope, envelope.timestamp)?;
    let body = rpc_body(
        RpcMethod::Store,
        json!({
            "pubKey": recipient,
            "ttl": DEFAULT_TTL_MS.to_string(),
            "timestamp": envelope.timestamp.to_string(),
            "data": BASE64.encode(wrapped),
            "nonce": "",
        }),
    );
    let url = format!("{}:{}{}", address, port, RPC_PATH);
    let response = client
        .post(&url)
        .timeout(timeout)
        .header("Content-Type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .map_err(|e| {
            debug!(url = %url, error = %e, "direct send failed");
            NodeError::Transient { status: 0 }
        })?;
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    match classify_status(status, &text) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
