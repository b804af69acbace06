//! Local identity and the X25519 + ChaCha20-Poly1305 primitives used by onion layers.

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Prefix of a hex encoded public identity ("05" marks an X25519 identity key).
pub const IDENTITY_PREFIX: &str = "05";

const NONCE_SIZE: usize = 12;

/// X25519 public key (32 bytes).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    /// Parse a 64 character hex string.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::Key)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::Key)?;
        Ok(PublicKey(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Anything that can name the local public identity used as a mailbox key.
pub trait IdentityProvider: Send + Sync {
    fn public_identity(&self) -> String;
}

/// X25519 keypair. Keep secret key private; expose only the public key.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(secret)
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

impl IdentityProvider for Keypair {
    fn public_identity(&self) -> String {
        format!("{}{}", IDENTITY_PREFIX, self.public.to_hex())
    }
}

/// Derive a 32-byte symmetric key from a DH shared secret.
pub fn derive_symmetric_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"swarmlink-onion-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Result of encrypting for a recipient with a fresh ephemeral key.
pub struct EphemeralCiphertext {
    pub ciphertext: Vec<u8>,
    pub ephemeral_public: PublicKey,
    pub symmetric_key: [u8; 32],
}

/// Encrypt `plaintext` for `recipient` using a one-time ephemeral key.
/// The returned symmetric key is kept by the sender to decrypt the reply.
pub fn encrypt_for(recipient: &PublicKey, plaintext: &[u8]) -> Result<EphemeralCiphertext, CryptoError> {
    let ephemeral = Keypair::generate();
    let symmetric_key = derive_symmetric_key(&ephemeral.shared_secret(recipient));
    let ciphertext = seal(&symmetric_key, plaintext)?;
    Ok(EphemeralCiphertext {
        ciphertext,
        ephemeral_public: *ephemeral.public_key(),
        symmetric_key,
    })
}

/// Recipient side of `encrypt_for`. Returns the plaintext and the symmetric key for the reply.
pub fn decrypt_from(
    keypair: &Keypair,
    ephemeral_public: &PublicKey,
    ciphertext: &[u8],
) -> Result<(Vec<u8>, [u8; 32]), CryptoError> {
    let symmetric_key = derive_symmetric_key(&keypair.shared_secret(ephemeral_public));
    let plaintext = open(&symmetric_key, ciphertext)?;
    Ok((plaintext, symmetric_key))
}

/// ChaCha20-Poly1305 with a random 96-bit nonce prepended to the ciphertext.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::Key)?;
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    let sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Inverse of `seal`.
pub fn open(key: &[u8; 32], nonce_and_ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if nonce_and_ciphertext.len() < NONCE_SIZE {
        return Err(CryptoError::Decrypt);
    }
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::Key)?;
    let (nonce_bytes, ciphertext) = nonce_and_ciphertext.split_at(NONCE_SIZE);
    let nonce = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        nonce_bytes,
    );
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}
