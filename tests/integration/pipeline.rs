//! Security pipeline round trips: every policy-flag combination, the
//! key-rotation fallbacks, and the downgrade paths.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use trellis_core::envelope;
use trellis_core::payload::{self, PayloadError, SecurityParams};
use trellis_core::{KeyDirectory, LocalIdentity, MemoryKeyDirectory, PeerKeys, COMPRESS_LIMIT};

fn encrypt_params(need_compress: bool, need_encrypt: bool, target: Option<&str>) -> SecurityParams {
    SecurityParams {
        need_compress,
        need_encrypt,
        target_peer_id: target.map(String::from),
        ..SecurityParams::default()
    }
}

fn inverse_params(
    sealed: &SecurityParams,
    target: Option<&str>,
    src: Option<&str>,
) -> SecurityParams {
    SecurityParams {
        need_compress: sealed.need_compress,
        need_encrypt: sealed.need_encrypt,
        payload_signature: sealed.payload_signature.clone(),
        previous_public_key_payload_signature: sealed
            .previous_public_key_payload_signature
            .clone(),
        payload_key: sealed.payload_key.clone(),
        target_peer_id: target.map(String::from),
        src_peer_id: src.map(String::from),
        ..SecurityParams::default()
    }
}

// ── Round-trip matrix ─────────────────────────────────────────────────────────

#[tokio::test]
async fn roundtrip_every_flag_combination_local_target() {
    let identity = LocalIdentity::with_peer_id("peer-self");
    let directory = MemoryKeyDirectory::new();
    directory.publish("peer-self", identity.public_keys());
    let payload = json!({"kind": "note", "body": "remember this", "n": [1, 2, 3]});

    for (compress, encrypt) in [(false, false), (false, true), (true, false), (true, true)] {
        let sealed = payload::encrypt(
            &payload,
            &encrypt_params(compress, encrypt, None),
            &identity,
            &directory,
        )
        .await
        .unwrap();
        assert_eq!(sealed.need_encrypt, encrypt);
        // Local persistence compresses regardless of size.
        assert_eq!(sealed.need_compress, compress);
        assert!(sealed.payload_hash.is_some());

        let recovered = payload::decrypt(
            sealed.transport_payload.as_deref().unwrap(),
            &inverse_params(&sealed, None, None),
            &identity,
            &directory,
        )
        .await
        .unwrap();
        assert_eq!(recovered, Some(payload.clone()), "flags ({compress}, {encrypt})");
    }
}

#[tokio::test]
async fn roundtrip_every_flag_combination_remote_target() {
    let sender = LocalIdentity::with_peer_id("peer-a");
    let recipient = LocalIdentity::with_peer_id("peer-b");
    let directory = MemoryKeyDirectory::new();
    directory.publish("peer-a", sender.public_keys());
    directory.publish("peer-b", recipient.public_keys());

    // Long enough to clear the network compression threshold.
    let payload = Value::String("chain ".repeat(COMPRESS_LIMIT));

    for (compress, encrypt) in [(false, false), (false, true), (true, false), (true, true)] {
        let sealed = payload::encrypt(
            &payload,
            &encrypt_params(compress, encrypt, Some("peer-b")),
            &sender,
            &directory,
        )
        .await
        .unwrap();
        assert_eq!(sealed.need_compress, compress);
        assert_eq!(sealed.need_encrypt, encrypt);
        assert_eq!(sealed.payload_signature.is_some(), encrypt);
        assert_eq!(sealed.payload_key.is_some(), encrypt);

        let recovered = payload::decrypt(
            sealed.transport_payload.as_deref().unwrap(),
            &inverse_params(&sealed, Some("peer-b"), Some("peer-a")),
            &recipient,
            &directory,
        )
        .await
        .unwrap();
        assert_eq!(recovered, Some(payload.clone()), "flags ({compress}, {encrypt})");
    }
}

#[tokio::test]
async fn small_remote_payload_skips_compression_and_records_it() {
    let sender = LocalIdentity::with_peer_id("peer-a");
    let directory = MemoryKeyDirectory::new();
    let payload = json!({"a": 1});

    let sealed = payload::encrypt(
        &payload,
        &encrypt_params(true, false, Some("peer-b")),
        &sender,
        &directory,
    )
    .await
    .unwrap();

    // The inverse path must not attempt decompression.
    assert!(!sealed.need_compress);
    let raw = BASE64
        .decode(sealed.transport_payload.as_deref().unwrap())
        .unwrap();
    assert_eq!(raw, envelope::text_marshal(&payload).into_bytes());
}

// ── Persistence and downgrade paths ───────────────────────────────────────────

#[tokio::test]
async fn local_persistence_encrypts_to_own_key() {
    let identity = LocalIdentity::with_peer_id("peer-self");
    let directory = MemoryKeyDirectory::new();
    let payload = json!({"a": 1});

    let sealed = payload::encrypt(
        &payload,
        &encrypt_params(true, true, None),
        &identity,
        &directory,
    )
    .await
    .unwrap();
    assert!(sealed.need_encrypt);
    assert!(sealed.payload_key.is_some());
    // Nothing was signed: no remote target.
    assert!(sealed.payload_signature.is_none());

    // Only the same identity's private key opens it. A stranger with the
    // same peer id cannot.
    let stranger = LocalIdentity::with_peer_id("peer-self");
    let result = payload::decrypt(
        sealed.transport_payload.as_deref().unwrap(),
        &inverse_params(&sealed, None, None),
        &stranger,
        &directory,
    )
    .await;
    assert!(matches!(result, Err(PayloadError::KeyUnwrapExhausted)));

    let recovered = payload::decrypt(
        sealed.transport_payload.as_deref().unwrap(),
        &inverse_params(&sealed, None, None),
        &identity,
        &directory,
    )
    .await
    .unwrap();
    assert_eq!(recovered, Some(payload));
}

#[tokio::test]
async fn unknown_recipient_downgrades_to_unencrypted() {
    let sender = LocalIdentity::with_peer_id("peer-a");
    let directory = MemoryKeyDirectory::new(); // knows nobody
    let payload = json!({"hello": "stranger"});

    let sealed = payload::encrypt(
        &payload,
        &encrypt_params(true, true, Some("peer-unknown")),
        &sender,
        &directory,
    )
    .await
    .unwrap();

    assert!(!sealed.need_encrypt);
    assert!(sealed.payload_key.is_none());
    // Below the compression threshold, the wire form is the plain
    // serialized payload, base64 only.
    let raw = BASE64
        .decode(sealed.transport_payload.as_deref().unwrap())
        .unwrap();
    assert_eq!(raw, envelope::text_marshal(&payload).into_bytes());
}

// ── Key rotation ──────────────────────────────────────────────────────────────

/// A directory that serves a stale snapshot until `refresh` is called,
/// counting the refreshes.
struct StaleDirectory {
    stale: Mutex<Option<PeerKeys>>,
    current: Mutex<Option<PeerKeys>>,
    refreshes: AtomicUsize,
}

impl StaleDirectory {
    fn new(stale: PeerKeys, current: PeerKeys) -> Self {
        Self {
            stale: Mutex::new(Some(stale)),
            current: Mutex::new(Some(current)),
            refreshes: AtomicUsize::new(0),
        }
    }

    fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyDirectory for StaleDirectory {
    async fn public_keys(&self, _peer_id: &str) -> Option<PeerKeys> {
        *self.stale.lock().unwrap()
    }

    async fn refresh(&self, _peer_id: &str) -> Option<PeerKeys> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().unwrap()
    }
}

#[tokio::test]
async fn previous_key_signature_bridges_one_rotation() {
    let mut sender = LocalIdentity::with_peer_id("peer-a");
    let recipient = LocalIdentity::with_peer_id("peer-b");
    let keys_before = sender.public_keys();

    // The recipient's directory still holds the pre-rotation key.
    sender.rotate();
    let directory = StaleDirectory::new(keys_before, sender.public_keys());
    let recipient_directory = MemoryKeyDirectory::new();
    recipient_directory.publish("peer-b", recipient.public_keys());

    let payload = json!({"text": "mid-rotation"});
    let sealed = payload::encrypt(
        &payload,
        &encrypt_params(false, true, Some("peer-b")),
        &sender,
        &recipient_directory,
    )
    .await
    .unwrap();
    // Both signatures travel while an expired key is held.
    assert!(sealed.payload_signature.is_some());
    assert!(sealed.previous_public_key_payload_signature.is_some());

    let recovered = payload::decrypt(
        sealed.transport_payload.as_deref().unwrap(),
        &inverse_params(&sealed, Some("peer-b"), Some("peer-a")),
        &recipient,
        &directory,
    )
    .await
    .unwrap();
    assert_eq!(recovered, Some(payload));
    // The previous-key signature sufficed; no refresh was needed.
    assert_eq!(directory.refresh_count(), 0);
}

#[tokio::test]
async fn two_rotations_require_the_directory_refresh_path() {
    let mut sender = LocalIdentity::with_peer_id("peer-a");
    let recipient = LocalIdentity::with_peer_id("peer-b");
    let keys_before = sender.public_keys();

    sender.rotate();
    sender.rotate();
    let directory = StaleDirectory::new(keys_before, sender.public_keys());
    let recipient_directory = MemoryKeyDirectory::new();
    recipient_directory.publish("peer-b", recipient.public_keys());

    let payload = json!({"text": "twice rotated"});
    let sealed = payload::encrypt(
        &payload,
        &encrypt_params(false, true, Some("peer-b")),
        &sender,
        &recipient_directory,
    )
    .await
    .unwrap();

    let recovered = payload::decrypt(
        sealed.transport_payload.as_deref().unwrap(),
        &inverse_params(&sealed, Some("peer-b"), Some("peer-a")),
        &recipient,
        &directory,
    )
    .await
    .unwrap();
    // Neither held signature verifies against the stale key; the forced
    // refresh resolves the current key and the primary signature passes.
    assert_eq!(recovered, Some(payload));
    assert_eq!(directory.refresh_count(), 1);
}

#[tokio::test]
async fn verification_failure_is_nonfatal_when_refresh_stays_stale() {
    let mut sender = LocalIdentity::with_peer_id("peer-a");
    let recipient = LocalIdentity::with_peer_id("peer-b");
    let keys_before = sender.public_keys();

    sender.rotate();
    sender.rotate();
    // refresh returns the same stale key: verification can never succeed.
    let directory = StaleDirectory::new(keys_before, keys_before);
    let recipient_directory = MemoryKeyDirectory::new();
    recipient_directory.publish("peer-b", recipient.public_keys());

    let payload = json!({"text": "unverifiable"});
    let sealed = payload::encrypt(
        &payload,
        &encrypt_params(false, true, Some("peer-b")),
        &sender,
        &recipient_directory,
    )
    .await
    .unwrap();

    // Delivered anyway: verification failure is logged, not fatal.
    let recovered = payload::decrypt(
        sealed.transport_payload.as_deref().unwrap(),
        &inverse_params(&sealed, Some("peer-b"), Some("peer-a")),
        &recipient,
        &directory,
    )
    .await
    .unwrap();
    assert_eq!(recovered, Some(payload));
    assert_eq!(directory.refresh_count(), 1);
}

// ── Re-seal path ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn existing_payload_key_is_unwrapped_and_reused() {
    let owner = LocalIdentity::with_peer_id("peer-a");
    let recipient = LocalIdentity::with_peer_id("peer-b");
    let directory = MemoryKeyDirectory::new();
    directory.publish("peer-a", owner.public_keys());
    directory.publish("peer-b", recipient.public_keys());

    let payload = json!({"stored": "locally"});

    // First sealed for local persistence: the payload key is wrapped
    // under the owner's own agreement key.
    let local = payload::encrypt(
        &payload,
        &encrypt_params(false, true, None),
        &owner,
        &directory,
    )
    .await
    .unwrap();

    // Re-seal toward a remote recipient, reusing the same symmetric key
    // without ever needing the plaintext again.
    let resealed = payload::encrypt(
        &payload,
        &SecurityParams {
            need_compress: false,
            need_encrypt: true,
            payload_key: local.payload_key.clone(),
            target_peer_id: Some("peer-b".into()),
            ..SecurityParams::default()
        },
        &owner,
        &directory,
    )
    .await
    .unwrap();

    let recovered = payload::decrypt(
        resealed.transport_payload.as_deref().unwrap(),
        &inverse_params(&resealed, Some("peer-b"), Some("peer-a")),
        &recipient,
        &directory,
    )
    .await
    .unwrap();
    assert_eq!(recovered, Some(payload));
}

#[tokio::test]
async fn reseal_with_foreign_payload_key_fails() {
    let owner = LocalIdentity::with_peer_id("peer-a");
    let other = LocalIdentity::with_peer_id("peer-c");
    let directory = MemoryKeyDirectory::new();
    directory.publish("peer-a", owner.public_keys());
    directory.publish("peer-c", other.public_keys());

    let payload = json!({"stored": "elsewhere"});
    // Sealed under peer-c's key; peer-a cannot reopen it.
    let foreign = payload::encrypt(
        &payload,
        &encrypt_params(false, true, Some("peer-c")),
        &owner,
        &directory,
    )
    .await
    .unwrap();

    let result = payload::encrypt(
        &payload,
        &SecurityParams {
            need_encrypt: true,
            payload_key: foreign.payload_key.clone(),
            target_peer_id: Some("peer-c".into()),
            ..SecurityParams::default()
        },
        &owner,
        &directory,
    )
    .await;
    assert!(matches!(result, Err(PayloadError::KeyResealFailed)));
}
