//! Chain-message envelope — the unit of application-level communication.
//!
//! A `ChainMessage` travels in one of two forms. In *logical form* the
//! `payload` field carries an in-memory JSON value and `transport_payload`
//! is empty. In *wire form* the security pipeline has folded the payload
//! into `transport_payload` (signed/compressed/encrypted/base64) and
//! `payload` is empty. At most one of the two is populated at any point
//! after the pipeline has run in either direction.
//!
//! The wire format is one JSON record per message, newline-terminated.
//! The envelope IS the protocol, so it lives in the shared crate.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

// ── Message direction ─────────────────────────────────────────────────────────

/// Whether an envelope carries a request or the reply to one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgDirect {
    #[default]
    Request,
    Response,
}

// ── Message types ─────────────────────────────────────────────────────────────

/// Well-known message-type tags.
///
/// The envelope carries the tag as a plain string so applications can route
/// types this enum has never heard of; `MsgType` exists for the types the
/// built-in actions and control replies speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Undefined,
    // Control markers used as reply payloads.
    Ok,
    Wait,
    Error,
    Untrust,
    NoResponse,
    Response,
    Reject,
    // Application capabilities.
    Ping,
    P2pChat,
    Chat,
    FindPeer,
    GetValue,
    PutValue,
    Signal,
    RtcCandidate,
    RtcAnswer,
    RtcOffer,
    Connect,
    FindClient,
    // Consensus rounds are routed, never executed, by this layer.
    Consensus,
    ConsensusReply,
    ConsensusRaft,
    ConsensusRaftReply,
    ConsensusPbft,
    ConsensusPbftReply,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Undefined => "UNDEFINED",
            MsgType::Ok => "OK",
            MsgType::Wait => "WAIT",
            MsgType::Error => "ERROR",
            MsgType::Untrust => "UNTRUST",
            MsgType::NoResponse => "NO_RESPONSE",
            MsgType::Response => "RESPONSE",
            MsgType::Reject => "REJECT",
            MsgType::Ping => "PING",
            MsgType::P2pChat => "P2PCHAT",
            MsgType::Chat => "CHAT",
            MsgType::FindPeer => "FINDPEER",
            MsgType::GetValue => "GETVALUE",
            MsgType::PutValue => "PUTVALUE",
            MsgType::Signal => "SIGNAL",
            MsgType::RtcCandidate => "RTCCANDIDATE",
            MsgType::RtcAnswer => "RTCANSWER",
            MsgType::RtcOffer => "RTCOFFER",
            MsgType::Connect => "CONNECT",
            MsgType::FindClient => "FINDCLIENT",
            MsgType::Consensus => "CONSENSUS",
            MsgType::ConsensusReply => "CONSENSUS_REPLY",
            MsgType::ConsensusRaft => "CONSENSUS_RAFT",
            MsgType::ConsensusRaftReply => "CONSENSUS_RAFT_REPLY",
            MsgType::ConsensusPbft => "CONSENSUS_PBFT",
            MsgType::ConsensusPbftReply => "CONSENSUS_PBFT_REPLY",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "UNDEFINED" => Some(MsgType::Undefined),
            "OK" => Some(MsgType::Ok),
            "WAIT" => Some(MsgType::Wait),
            "ERROR" => Some(MsgType::Error),
            "UNTRUST" => Some(MsgType::Untrust),
            "NO_RESPONSE" => Some(MsgType::NoResponse),
            "RESPONSE" => Some(MsgType::Response),
            "REJECT" => Some(MsgType::Reject),
            "PING" => Some(MsgType::Ping),
            "P2PCHAT" => Some(MsgType::P2pChat),
            "CHAT" => Some(MsgType::Chat),
            "FINDPEER" => Some(MsgType::FindPeer),
            "GETVALUE" => Some(MsgType::GetValue),
            "PUTVALUE" => Some(MsgType::PutValue),
            "SIGNAL" => Some(MsgType::Signal),
            "RTCCANDIDATE" => Some(MsgType::RtcCandidate),
            "RTCANSWER" => Some(MsgType::RtcAnswer),
            "RTCOFFER" => Some(MsgType::RtcOffer),
            "CONNECT" => Some(MsgType::Connect),
            "FINDCLIENT" => Some(MsgType::FindClient),
            "CONSENSUS" => Some(MsgType::Consensus),
            "CONSENSUS_REPLY" => Some(MsgType::ConsensusReply),
            "CONSENSUS_RAFT" => Some(MsgType::ConsensusRaft),
            "CONSENSUS_RAFT_REPLY" => Some(MsgType::ConsensusRaftReply),
            "CONSENSUS_PBFT" => Some(MsgType::ConsensusPbft),
            "CONSENSUS_PBFT_REPLY" => Some(MsgType::ConsensusPbftReply),
            _ => None,
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known `payload_type` strings.
pub mod payload_type {
    pub const MAP: &str = "map";
    pub const STRING: &str = "string";
    pub const PEER_CLIENT: &str = "peerClient";
    pub const DATA_BLOCK: &str = "dataBlock";
    pub const CONSENSUS_LOG: &str = "consensusLog";
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// The wire envelope.
///
/// `uuid` is generated once per logical message and shared by all of its
/// slices. `target_peer_id` names the final logical recipient; the
/// `connect_*` fields name the immediate network hop, which may differ.
/// The `src_*` and `local_connect_*` fields are empty on send and filled
/// in by the receiving side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainMessage {
    pub uuid: String,
    pub message_type: String,
    pub message_direct: MsgDirect,

    /// Final logical recipient. A node that is not the target relays.
    pub target_peer_id: Option<String>,
    /// Immediate network hop by peer id.
    pub connect_peer_id: Option<String>,
    /// Immediate network hop by non-P2P address (ws://, http://).
    pub connect_address: Option<String>,
    /// Publish/subscribe destination.
    pub topic: Option<String>,

    /// Originating peer. Backfilled by the first receiving hop if empty.
    pub src_peer_id: Option<String>,
    pub src_address: Option<String>,
    /// The physical connection this envelope arrived on. Never sent.
    pub local_connect_peer_id: Option<String>,
    pub local_connect_address: Option<String>,

    /// Logical-form payload. Never transmitted populated.
    pub payload: Option<Value>,
    /// How to interpret `payload` (see [`payload_type`]).
    pub payload_type: Option<String>,
    /// Wire-form payload: security-pipeline output, base64-encoded.
    pub transport_payload: Option<String>,
    /// Sender's signature over the serialized payload, base64.
    pub payload_signature: Option<String>,
    /// Signature under the sender's prior, not-yet-purged key.
    pub previous_public_key_payload_signature: Option<String>,
    /// The payload's symmetric key, sealed to the recipient, base64.
    pub payload_key: Option<String>,

    pub need_compress: bool,
    pub need_encrypt: bool,
    pub need_slice: bool,

    /// Total slice count. Set on every copy of a sliced message.
    pub slice_size: Option<u32>,
    /// 0-based position of this slice.
    pub slice_number: u32,

    /// Human-readable status text.
    pub tip: Option<String>,
    /// Unix timestamp in milliseconds.
    pub create_timestamp: u64,
}

impl ChainMessage {
    /// Create an envelope with a fresh uuid and timestamp.
    pub fn new(message_type: impl Into<String>, message_direct: MsgDirect) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            message_direct,
            create_timestamp: now_millis(),
            ..Self::default()
        }
    }

    /// Exhaustive field copy for one slice of an oversized message.
    ///
    /// Every envelope field is listed here deliberately: adding a field to
    /// `ChainMessage` must force this site to be revisited.
    pub fn clone_for_slice(&self, slice_number: u32, slice_payload: Value) -> Self {
        Self {
            uuid: self.uuid.clone(),
            message_type: self.message_type.clone(),
            message_direct: self.message_direct,
            target_peer_id: self.target_peer_id.clone(),
            connect_peer_id: self.connect_peer_id.clone(),
            connect_address: self.connect_address.clone(),
            topic: self.topic.clone(),
            src_peer_id: self.src_peer_id.clone(),
            src_address: self.src_address.clone(),
            local_connect_peer_id: self.local_connect_peer_id.clone(),
            local_connect_address: self.local_connect_address.clone(),
            payload: Some(slice_payload),
            payload_type: self.payload_type.clone(),
            transport_payload: self.transport_payload.clone(),
            payload_signature: self.payload_signature.clone(),
            previous_public_key_payload_signature: self
                .previous_public_key_payload_signature
                .clone(),
            payload_key: self.payload_key.clone(),
            need_compress: self.need_compress,
            need_encrypt: self.need_encrypt,
            need_slice: self.need_slice,
            slice_size: self.slice_size,
            slice_number,
            tip: self.tip.clone(),
            create_timestamp: self.create_timestamp,
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Serialization ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("envelope deserialization failed: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Serialize an envelope to its wire bytes: one JSON record plus `\n`.
pub fn marshal(msg: &ChainMessage) -> Result<Vec<u8>, EnvelopeError> {
    let mut bytes = serde_json::to_vec(msg).map_err(EnvelopeError::Serialize)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse wire bytes back into an envelope. Tolerates the trailing newline.
pub fn unmarshal(data: &[u8]) -> Result<ChainMessage, EnvelopeError> {
    serde_json::from_slice(data).map_err(EnvelopeError::Deserialize)
}

/// Canonical text form of a payload value.
pub fn text_marshal(value: &Value) -> String {
    value.to_string()
}

/// Inverse of [`text_marshal`].
pub fn text_unmarshal(text: &str) -> Result<Value, EnvelopeError> {
    serde_json::from_str(text).map_err(EnvelopeError::Deserialize)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
