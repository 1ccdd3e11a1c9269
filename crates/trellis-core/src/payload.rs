//! Security payload pipeline — sign, compress, encrypt, and the inverse.
//!
//! [`encrypt`] turns an in-memory payload into its wire form:
//!
//!   1. serialize to canonical JSON text
//!   2. sign the plaintext bytes (remote targets only), with a second
//!      signature under the most recently expired key while mid-rotation
//!   3. DEFLATE-compress (always for local persistence, above
//!      [`COMPRESS_LIMIT`] for network payloads)
//!   4. AEAD-encrypt under a fresh symmetric key, sealed to the
//!      recipient's X25519 key
//!   5. base64-encode; hash the pre-base64 bytes
//!
//! [`decrypt`] inverts the pipeline, falling back to expired keys when
//! unwrapping the payload key and to the previous-key signature (then a
//! directory refresh) when verifying. Both functions are stateless: all
//! cryptographic metadata rides in a per-call [`SecurityParams`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::Signature;
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use std::io::Read;
use thiserror::Error;
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};
use zeroize::Zeroizing;

use crate::envelope::{self, EnvelopeError};
use crate::identity::{KeyDirectory, LocalIdentity, PeerKeys};

/// Network payloads shorter than this are sent uncompressed.
pub const COMPRESS_LIMIT: usize = 2048;

/// Domain separator for deriving key-encryption keys from ECDH output.
const KEY_SEAL_CONTEXT: &str = "trellis v1 payload key seal";

// ── Parameters ────────────────────────────────────────────────────────────────

/// Per-call bundle of cryptographic metadata.
///
/// Inputs name the policy and the endpoints; outputs carry everything the
/// inverse call needs. Created fresh for every call, never persisted.
#[derive(Debug, Clone, Default)]
pub struct SecurityParams {
    pub transport_payload: Option<String>,
    pub payload_signature: Option<String>,
    pub previous_public_key_payload_signature: Option<String>,
    pub need_compress: bool,
    pub need_encrypt: bool,
    pub payload_key: Option<String>,
    pub target_peer_id: Option<String>,
    pub src_peer_id: Option<String>,
    pub payload_hash: Option<String>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("transport payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("recovered payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("compression failed: {0}")]
    Compress(#[source] std::io::Error),

    #[error("decompression failed: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("payload encryption failed")]
    Encrypt,

    #[error("payload decryption failed")]
    Decrypt,

    #[error("sealed payload key is malformed")]
    MalformedPayloadKey,

    #[error("no current or expired key can unwrap the payload key")]
    KeyUnwrapExhausted,

    #[error("existing payload key cannot be reopened with the local agreement key")]
    KeyResealFailed,

    #[error("message carries a signature but names no remote source peer")]
    MissingSourceIdentity,

    #[error("no public key known for signer {0}")]
    UnknownSigner(String),
}

// ── Encrypt ───────────────────────────────────────────────────────────────────

/// Transform a payload into its wire form.
///
/// Inputs read from `params`: `need_compress`, `need_encrypt`,
/// `target_peer_id` (absent for local persistence), and optionally
/// `payload_key` when re-sealing a payload whose symmetric key was
/// wrapped under a since-rotated identity.
///
/// An unresolvable recipient key downgrades to an unencrypted send with
/// a logged warning rather than failing the call.
pub async fn encrypt(
    payload: &Value,
    params: &SecurityParams,
    identity: &LocalIdentity,
    directory: &dyn KeyDirectory,
) -> Result<SecurityParams, PayloadError> {
    let text = envelope::text_marshal(payload);
    let mut data = text.clone().into_bytes();

    let mut result = SecurityParams {
        need_compress: params.need_compress,
        need_encrypt: params.need_encrypt,
        ..SecurityParams::default()
    };

    let target = params
        .target_peer_id
        .as_deref()
        .filter(|t| !t.is_empty());
    let remote_target = target.filter(|t| *t != identity.peer_id());

    // Local persistence is not signed; only payloads leaving this peer are.
    if params.need_encrypt && remote_target.is_some() {
        let signature = identity.keypair().sign(&data);
        result.payload_signature = Some(BASE64.encode(signature.to_bytes()));
        if let Some(previous) = identity.expired_keys().first() {
            let previous_signature = previous.sign(&data);
            result.previous_public_key_payload_signature =
                Some(BASE64.encode(previous_signature.to_bytes()));
        }
    }

    // Local persistence always compresses; network payloads only above the
    // threshold. The flag in the result must reflect what actually happened.
    if params.need_compress && (target.is_none() || text.len() > COMPRESS_LIMIT) {
        data = compress(&data).map_err(PayloadError::Compress)?;
    } else {
        result.need_compress = false;
    }

    if params.need_encrypt {
        let recipient = match remote_target {
            Some(peer) => directory.public_keys(peer).await,
            None => Some(identity.public_keys()),
        };
        match recipient {
            None => {
                tracing::warn!(
                    target_peer = remote_target.unwrap_or_default(),
                    "no public key for encryption target, sending unencrypted"
                );
                result.need_encrypt = false;
            }
            Some(keys) => {
                let secret = match params.payload_key.as_deref().filter(|k| !k.is_empty()) {
                    // Re-seal: recover the original symmetric key with our own
                    // agreement secret so the plaintext is not needed again.
                    Some(sealed) => unseal_key(sealed, identity.keypair().agreement_secret())
                        .map_err(|_| PayloadError::KeyResealFailed)?,
                    None => {
                        let mut key = [0u8; 32];
                        OsRng.fill_bytes(&mut key);
                        Zeroizing::new(key)
                    }
                };
                data = symmetric_encrypt(&secret, &data)?;
                result.payload_key = Some(seal_key(&secret, &keys.agreement)?);
            }
        }
    }

    result.payload_hash = Some(BASE64.encode(blake3::hash(&data).as_bytes()));
    result.transport_payload = Some(BASE64.encode(&data));
    Ok(result)
}

// ── Decrypt ───────────────────────────────────────────────────────────────────

/// Recover the logical payload from its wire form.
///
/// Returns `Ok(None)` when the resolved target is not the local identity:
/// a relaying hop must forward the wire form untouched.
pub async fn decrypt(
    transport_payload: &str,
    params: &SecurityParams,
    identity: &LocalIdentity,
    directory: &dyn KeyDirectory,
) -> Result<Option<Value>, PayloadError> {
    if let Some(target) = params.target_peer_id.as_deref().filter(|t| !t.is_empty()) {
        if target != identity.peer_id() {
            return Ok(None);
        }
    }

    let mut data = BASE64.decode(transport_payload)?;

    if params.need_encrypt {
        if let Some(sealed) = params.payload_key.as_deref().filter(|k| !k.is_empty()) {
            let secret = unwrap_with_held_keys(sealed, identity)?;
            data = symmetric_decrypt(&secret, &data)?;
        }
    }

    if params.need_compress {
        data = decompress(&data).map_err(PayloadError::Decompress)?;
    }

    if params.need_encrypt {
        if let Some(signature) = params.payload_signature.as_deref().filter(|s| !s.is_empty()) {
            verify_signature(&data, signature, params, identity, directory).await?;
        }
    }

    let text = String::from_utf8(data)?;
    Ok(Some(envelope::text_unmarshal(&text)?))
}

/// Try the current agreement secret, then each expired one,
/// most recently expired first.
fn unwrap_with_held_keys(
    sealed: &str,
    identity: &LocalIdentity,
) -> Result<Zeroizing<[u8; 32]>, PayloadError> {
    if let Ok(secret) = unseal_key(sealed, identity.keypair().agreement_secret()) {
        return Ok(secret);
    }
    for expired in identity.expired_keys() {
        if let Ok(secret) = unseal_key(sealed, expired.agreement_secret()) {
            tracing::debug!("payload key unwrapped with an expired agreement key");
            return Ok(secret);
        }
    }
    Err(PayloadError::KeyUnwrapExhausted)
}

/// Verify the payload signature with every fallback the protocol allows.
///
/// Order: primary signature under the directory's cached key, then the
/// previous-key signature, then the primary once more after a forced
/// directory refresh. A signature that still fails is logged and the
/// payload delivered anyway — flagged for product review, see DESIGN.md.
async fn verify_signature(
    data: &[u8],
    signature: &str,
    params: &SecurityParams,
    identity: &LocalIdentity,
    directory: &dyn KeyDirectory,
) -> Result<(), PayloadError> {
    let src = params
        .src_peer_id
        .as_deref()
        .filter(|s| !s.is_empty() && *s != identity.peer_id())
        .ok_or(PayloadError::MissingSourceIdentity)?;

    let keys = directory
        .public_keys(src)
        .await
        .ok_or_else(|| PayloadError::UnknownSigner(src.to_string()))?;

    if verify_one(&keys, data, signature) {
        return Ok(());
    }
    if let Some(previous) = params
        .previous_public_key_payload_signature
        .as_deref()
        .filter(|s| !s.is_empty())
    {
        if verify_one(&keys, data, previous) {
            return Ok(());
        }
    }
    // The signer may have rotated past everything we hold; re-resolve once.
    if let Some(refreshed) = directory.refresh(src).await {
        if verify_one(&refreshed, data, signature) {
            return Ok(());
        }
    }
    tracing::error!(src_peer = src, "payload signature verification failed, delivering anyway");
    Ok(())
}

fn verify_one(keys: &PeerKeys, data: &[u8], signature_b64: &str) -> bool {
    let Ok(bytes) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(raw) = <[u8; 64]>::try_from(bytes.as_slice()) else {
        return false;
    };
    keys.verify(data, &Signature::from_bytes(&raw))
}

// ── Key sealing ───────────────────────────────────────────────────────────────

// Sealed-key wire form: ephemeral X25519 public key (32) ‖ nonce (24) ‖
// AEAD box of the 32-byte symmetric key (48), base64-encoded.

fn seal_key(secret: &[u8; 32], recipient: &AgreementPublic) -> Result<String, PayloadError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = AgreementPublic::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    let kek = blake3::derive_key(KEY_SEAL_CONTEXT, shared.as_bytes());

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&kek));
    let mut nonce = [0u8; 24];
    OsRng.fill_bytes(&mut nonce);
    let boxed = cipher
        .encrypt(XNonce::from_slice(&nonce), secret.as_slice())
        .map_err(|_| PayloadError::Encrypt)?;

    let mut out = Vec::with_capacity(32 + 24 + boxed.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&boxed);
    Ok(BASE64.encode(out))
}

fn unseal_key(
    sealed: &str,
    agreement_secret: &StaticSecret,
) -> Result<Zeroizing<[u8; 32]>, PayloadError> {
    let raw = BASE64.decode(sealed)?;
    if raw.len() < 32 + 24 + 16 {
        return Err(PayloadError::MalformedPayloadKey);
    }
    let ephemeral_public = <[u8; 32]>::try_from(&raw[..32])
        .map(AgreementPublic::from)
        .map_err(|_| PayloadError::MalformedPayloadKey)?;
    let shared = agreement_secret.diffie_hellman(&ephemeral_public);
    let kek = blake3::derive_key(KEY_SEAL_CONTEXT, shared.as_bytes());

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&kek));
    let opened = cipher
        .decrypt(XNonce::from_slice(&raw[32..56]), &raw[56..])
        .map_err(|_| PayloadError::Decrypt)?;
    let key = <[u8; 32]>::try_from(opened.as_slice())
        .map_err(|_| PayloadError::MalformedPayloadKey)?;
    Ok(Zeroizing::new(key))
}

// ── Symmetric encryption ──────────────────────────────────────────────────────

// Wire form: nonce (24) ‖ ciphertext + Poly1305 tag.

fn symmetric_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, PayloadError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; 24];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| PayloadError::Encrypt)?;

    let mut out = Vec::with_capacity(24 + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn symmetric_decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, PayloadError> {
    if data.len() < 24 + 16 {
        return Err(PayloadError::Decrypt);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(&data[..24]), &data[24..])
        .map_err(|_| PayloadError::Decrypt)
}

// ── Compression ───────────────────────────────────────────────────────────────

fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(data, Compression::default());
    let mut out = Vec::new();
    encoder.read_to_end(&mut out)?;
    Ok(out)
}

fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
