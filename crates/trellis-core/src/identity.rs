//! Local identity and key-directory contracts.
//!
//! An identity pairs an Ed25519 signing key with an X25519 agreement
//! secret. Rotation keeps the replaced pair on an ordered "expired" list
//! (most recently expired first) so in-flight messages sealed or signed
//! under the old key remain verifiable and decryptable during the grace
//! period. The peer id is derived from the *initial* signing key and is
//! stable across rotations — directories map a peer id to whatever key
//! the peer currently holds.

use async_trait::async_trait;
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};

// ── Public key set ────────────────────────────────────────────────────────────

/// The public half of a peer's keypair: one key to verify signatures,
/// one to seal symmetric keys toward the peer.
#[derive(Debug, Clone, Copy)]
pub struct PeerKeys {
    pub signing: VerifyingKey,
    pub agreement: AgreementPublic,
}

impl PeerKeys {
    /// Verify an Ed25519 signature over `data`.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        self.signing.verify(data, signature).is_ok()
    }
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A private signing + agreement pair. Key material is wiped on drop by
/// the dalek crates' zeroize support.
pub struct Keypair {
    signing: SigningKey,
    agreement: StaticSecret,
}

impl Keypair {
    /// Generate a fresh pair from OS entropy.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            agreement: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn public_keys(&self) -> PeerKeys {
        PeerKeys {
            signing: self.signing.verifying_key(),
            agreement: AgreementPublic::from(&self.agreement),
        }
    }

    /// Sign `data` with the Ed25519 key.
    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing.sign(data)
    }

    pub(crate) fn agreement_secret(&self) -> &StaticSecret {
        &self.agreement
    }
}

// ── Local identity ────────────────────────────────────────────────────────────

/// The local peer: a stable id, the current keypair, and the ordered list
/// of expired keypairs kept for rotation continuity.
///
/// An identity always holds a private key by construction, so the
/// "missing local private key" failure of looser key stores cannot arise.
pub struct LocalIdentity {
    peer_id: String,
    current: Keypair,
    expired: Vec<Keypair>,
}

impl LocalIdentity {
    /// Generate an identity whose peer id is derived from its first
    /// signing key. Rotation does not change the id.
    pub fn generate() -> Self {
        let current = Keypair::generate();
        let peer_id = derive_peer_id(&current);
        Self {
            peer_id,
            current,
            expired: Vec::new(),
        }
    }

    /// An identity with a caller-chosen peer id.
    pub fn with_peer_id(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            current: Keypair::generate(),
            expired: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.current
    }

    pub fn public_keys(&self) -> PeerKeys {
        self.current.public_keys()
    }

    /// Expired keypairs, most recently expired first.
    pub fn expired_keys(&self) -> &[Keypair] {
        &self.expired
    }

    /// Replace the current keypair, moving it to the front of the
    /// expired list.
    pub fn rotate(&mut self) {
        let retired = std::mem::replace(&mut self.current, Keypair::generate());
        self.expired.insert(0, retired);
        tracing::info!(peer_id = %self.peer_id, held = self.expired.len(), "identity key rotated");
    }

    /// Drop all expired keypairs. Messages sealed under them become
    /// undecryptable.
    pub fn purge_expired(&mut self) {
        self.expired.clear();
    }
}

fn derive_peer_id(keypair: &Keypair) -> String {
    let digest = blake3::hash(keypair.public_keys().signing.as_bytes());
    hex::encode(&digest.as_bytes()[..16])
}

// ── Key directory ─────────────────────────────────────────────────────────────

/// Resolves a peer id to the peer's current public keys.
///
/// Implementations may consult caches or the network; the pipeline only
/// sees `Some`/`None`. `refresh` forces re-resolution and is called when
/// a signature fails under the cached key — the signer may have rotated.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn public_keys(&self, peer_id: &str) -> Option<PeerKeys>;

    async fn refresh(&self, peer_id: &str) -> Option<PeerKeys> {
        self.public_keys(peer_id).await
    }
}

/// In-process key directory backed by a concurrent map.
#[derive(Default)]
pub struct MemoryKeyDirectory {
    entries: DashMap<String, PeerKeys>,
}

impl MemoryKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) a peer's public keys.
    pub fn publish(&self, peer_id: impl Into<String>, keys: PeerKeys) {
        self.entries.insert(peer_id.into(), keys);
    }

    pub fn forget(&self, peer_id: &str) {
        self.entries.remove(peer_id);
    }
}

#[async_trait]
impl KeyDirectory for MemoryKeyDirectory {
    async fn public_keys(&self, peer_id: &str) -> Option<PeerKeys> {
        self.entries.get(peer_id).map(|e| *e.value())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
