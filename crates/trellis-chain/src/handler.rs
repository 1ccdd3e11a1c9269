//! Chain-message handler — the orchestrator between actions, the
//! security pipeline, and the transports.
//!
//! Outbound: encrypt the envelope, serialize, route by precedence, decode
//! the reply. Inbound: deserialize, backfill source fields, decrypt,
//! dispatch to the registered action, and ship a well-formed reply —
//! errors included — back to the transport. Slicing and reassembly of
//! oversized payloads live here too.

use bytes::Bytes;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use trellis_core::envelope::{self, payload_type};
use trellis_core::payload::{self, PayloadError, SecurityParams};
use trellis_core::{ChainConfig, ChainMessage, KeyDirectory, LocalIdentity, MsgDirect, MsgType};

use crate::dispatch::ChainDispatcher;
use crate::transport::{RawInbound, TransportReply, TransportSet};

// ── Slice reassembly ──────────────────────────────────────────────────────────

struct SliceAssembly {
    slots: Vec<Option<ChainMessage>>,
    received: usize,
    created_at: Instant,
}

// ── Handler ───────────────────────────────────────────────────────────────────

pub struct ChainMessageHandler {
    identity: Arc<LocalIdentity>,
    directory: Arc<dyn KeyDirectory>,
    dispatcher: Arc<ChainDispatcher>,
    transports: TransportSet,
    config: ChainConfig,
    /// uuid -> partially reassembled slices. Completion is decided under
    /// this lock, in the same critical section as the insert.
    assemblies: Mutex<HashMap<String, SliceAssembly>>,
}

impl ChainMessageHandler {
    pub fn new(
        identity: Arc<LocalIdentity>,
        directory: Arc<dyn KeyDirectory>,
        dispatcher: Arc<ChainDispatcher>,
        transports: TransportSet,
        config: ChainConfig,
    ) -> Self {
        Self {
            identity,
            directory,
            dispatcher,
            transports,
            config,
            assemblies: Mutex::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &Arc<LocalIdentity> {
        &self.identity
    }

    pub fn dispatcher(&self) -> &Arc<ChainDispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// The raw-receive callback to hand to transports. Topic buses pass
    /// `None` for the remote fields.
    pub fn inbound(self: &Arc<Self>) -> RawInbound {
        let handler = Arc::clone(self);
        Arc::new(move |data: Bytes, peer: Option<String>, addr: Option<String>| {
            let handler = Arc::clone(&handler);
            async move { handler.receive_raw(&data, peer, addr).await }.boxed()
        })
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Send one envelope and await its reply, if any.
    ///
    /// Every transport failure is recovered as "no result": the caller
    /// sees `Ok(None)`, never a routing exception.
    pub async fn send(&self, mut msg: ChainMessage) -> anyhow::Result<Option<ChainMessage>> {
        self.encrypt_envelope(&mut msg).await?;
        let data = Bytes::from(envelope::marshal(&msg)?);

        let reply = self.route(&msg, data).await;
        match reply {
            Some(reply) if !reply.data.is_empty() => {
                self.response_raw(&reply.data, reply.peer_id, reply.address)
                    .await
            }
            _ => Ok(None),
        }
    }

    /// Routing precedence, first match wins:
    ///   (a) direct link to the logical target, when connected or when the
    ///       message type mandates direct transport;
    ///   (b) direct link to the hop, else the routed transport;
    ///   (c) a fallback address transport selected by scheme;
    ///   (d) a topic publish, in addition to (or instead of) the above.
    async fn route(&self, msg: &ChainMessage, data: Bytes) -> Option<TransportReply> {
        let mut sent = false;
        let mut reply = None;

        let target = msg.target_peer_id.as_deref().filter(|t| !t.is_empty());
        let connect = msg.connect_peer_id.as_deref().filter(|c| !c.is_empty());
        let address = msg.connect_address.as_deref().filter(|a| !a.is_empty());
        let topic = msg.topic.as_deref().filter(|t| !t.is_empty());

        if let (Some(target), Some(direct)) = (target, self.transports.direct.as_ref()) {
            if msg.message_type == MsgType::P2pChat.as_str() || direct.is_connected(target).await {
                sent = true;
                reply = match direct.send(target, data.clone()).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(peer = target, error = %e, "direct send to target failed");
                        None
                    }
                };
            }
        }

        if !sent {
            if let Some(connect) = connect {
                if let Some(direct) = self.transports.direct.as_ref() {
                    if direct.is_connected(connect).await {
                        sent = true;
                        reply = match direct.send(connect, data.clone()).await {
                            Ok(r) => r,
                            Err(e) => {
                                tracing::warn!(peer = connect, error = %e, "direct send to hop failed");
                                None
                            }
                        };
                    }
                }
                if !sent {
                    if let Some(routed) = self.transports.routed.as_ref() {
                        sent = true;
                        reply = match routed
                            .send(connect, &self.config.network.chain_protocol_id, data.clone())
                            .await
                        {
                            Ok(r) => r,
                            Err(e) => {
                                tracing::warn!(peer = connect, error = %e, "routed send failed");
                                None
                            }
                        };
                    }
                }
            }
        }

        if !sent {
            if let Some(address) = address {
                for transport in &self.transports.address {
                    if transport.supports(address) {
                        sent = true;
                        reply = match transport.send(address, data.clone()).await {
                            Ok(r) => r,
                            Err(e) => {
                                tracing::warn!(address, error = %e, "address send failed");
                                None
                            }
                        };
                        break;
                    }
                }
            }
        }

        if let (Some(topic), Some(bus)) = (topic, self.transports.topic.as_ref()) {
            if let Err(e) = bus.publish(topic, data).await {
                tracing::warn!(topic, error = %e, "topic publish failed");
            }
        } else if !sent {
            tracing::warn!(
                message_type = %msg.message_type,
                "no reachable transport for message"
            );
        }

        reply
    }

    // ── Slicing ───────────────────────────────────────────────────────────────

    /// Split an oversized string payload into frame-sized slices.
    ///
    /// A message that is not sliceable — flag unset, non-string payload,
    /// payload within the frame, or already in flight (`src_peer_id` set;
    /// relays never re-slice) — comes back as a single-element vec.
    pub fn slice(&self, mut msg: ChainMessage) -> Vec<ChainMessage> {
        let frame = if msg.message_type == MsgType::P2pChat.as_str() {
            self.config.slicing.direct_frame_bytes
        } else {
            self.config.slicing.routed_frame_bytes
        };

        if !msg.need_slice {
            return vec![msg];
        }
        if msg.src_peer_id.as_deref().is_some_and(|s| !s.is_empty()) {
            return vec![msg];
        }
        let text = match &msg.payload {
            Some(Value::String(s)) if s.len() > frame => s.clone(),
            _ => return vec![msg],
        };

        let chunks = split_frames(&text, frame);
        msg.slice_size = Some(chunks.len() as u32);
        tracing::debug!(
            uuid = %msg.uuid,
            slices = chunks.len(),
            frame,
            "payload sliced"
        );
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| msg.clone_for_slice(i as u32, Value::String(chunk.to_string())))
            .collect()
    }

    /// Accumulate one slice; return the completed message exactly once.
    ///
    /// Unsliced messages pass through unchanged, as do messages whose
    /// resolved target is not this peer (reassembly happens only at the
    /// final recipient). Returns `None` while slices are outstanding.
    pub async fn merge(&self, msg: ChainMessage) -> Option<ChainMessage> {
        if !msg.need_slice {
            return Some(msg);
        }
        let Some(slice_size) = msg.slice_size.filter(|s| *s >= 2) else {
            return Some(msg);
        };
        let target = msg
            .target_peer_id
            .as_deref()
            .filter(|t| !t.is_empty())
            .or(msg.connect_peer_id.as_deref());
        if target != Some(self.identity.peer_id()) {
            return Some(msg);
        }

        let uuid = msg.uuid.clone();
        let index = msg.slice_number as usize;

        let mut assemblies = self.assemblies.lock().await;
        let ttl = Duration::from_secs(self.config.slicing.reassembly_ttl_secs);
        assemblies.retain(|uuid, assembly| {
            let stale = assembly.created_at.elapsed() > ttl;
            if stale {
                tracing::warn!(uuid = %uuid, "dropping stale slice assembly");
            }
            !stale
        });

        let assembly = assemblies
            .entry(uuid.clone())
            .or_insert_with(|| SliceAssembly {
                slots: vec![None; slice_size as usize],
                received: 0,
                created_at: Instant::now(),
            });
        if index >= assembly.slots.len() {
            tracing::warn!(uuid = %uuid, index, "slice number out of range, ignoring");
            return None;
        }
        if assembly.slots[index].is_none() {
            assembly.received += 1;
        }
        assembly.slots[index] = Some(msg);

        if assembly.received < assembly.slots.len() {
            return None;
        }

        let Some(mut assembly) = assemblies.remove(&uuid) else {
            return None;
        };
        let mut full = String::new();
        for slot in &assembly.slots {
            if let Some(Value::String(part)) = slot.as_ref().and_then(|m| m.payload.as_ref()) {
                full.push_str(part);
            }
        }
        let mut completed = assembly.slots[index].take()?;
        completed.payload = Some(Value::String(full));
        tracing::debug!(uuid = %uuid, slices = slice_size, "slices reassembled");
        Some(completed)
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Entry point for raw bytes from a transport. Always answers with a
    /// well-formed envelope (or nothing) — never an escaped error.
    pub async fn receive_raw(
        &self,
        data: &[u8],
        remote_peer_id: Option<String>,
        remote_address: Option<String>,
    ) -> Option<Bytes> {
        let mut msg = match envelope::unmarshal(data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable inbound frame");
                let reply = Self::error(MsgType::Undefined.as_str(), &e.to_string());
                return marshal_reply(&reply);
            }
        };

        // First hop: stamp the origin. Later hops leave it alone.
        if msg.src_peer_id.as_deref().unwrap_or("").is_empty() {
            msg.src_peer_id = remote_peer_id.clone();
        }
        if msg.src_address.as_deref().unwrap_or("").is_empty() {
            msg.src_address = remote_address.clone();
        }
        // The physical connection this data arrived on.
        msg.local_connect_peer_id = remote_peer_id;
        msg.local_connect_address = remote_address;

        let message_type = msg.message_type.clone();
        let reply_peer = msg.local_connect_peer_id.clone();
        let reply_address = msg.local_connect_address.clone();
        let reply_topic = msg.topic.clone();

        let mut response = match self.receive(msg).await {
            Ok(Some(response)) => response,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(message_type = %message_type, error = %e, "inbound dispatch failed");
                Self::error(&message_type, &e.to_string())
            }
        };

        if let Err(e) = self.encrypt_envelope(&mut response).await {
            tracing::warn!(message_type = %message_type, error = %e, "response encryption failed");
            response = Self::error(&message_type, &e.to_string());
        }

        // Address the reply back to the immediate sender; the "local
        // connect" fields never travel.
        response.local_connect_peer_id = None;
        response.local_connect_address = None;
        response.connect_peer_id = reply_peer;
        response.connect_address = reply_address;
        response.topic = reply_topic;

        marshal_reply(&response)
    }

    /// Decode the reply half of a transport round trip and run it through
    /// the response-direction receive path.
    pub async fn response_raw(
        &self,
        data: &[u8],
        remote_peer_id: Option<String>,
        remote_address: Option<String>,
    ) -> anyhow::Result<Option<ChainMessage>> {
        let mut msg = envelope::unmarshal(data)?;
        msg.local_connect_peer_id = remote_peer_id;
        msg.local_connect_address = remote_address;
        self.receive(msg).await
    }

    /// Shared receive path for both directions: decrypt, look up the
    /// registered action, dispatch.
    pub async fn receive(&self, mut msg: ChainMessage) -> anyhow::Result<Option<ChainMessage>> {
        if let Err(e) = self.decrypt_envelope(&mut msg).await {
            tracing::warn!(message_type = %msg.message_type, error = %e, "inbound payload rejected");
            return Ok(Some(Self::error(&msg.message_type, &e.to_string())));
        }

        let message_type = msg.message_type.clone();
        let Some(action) = self.dispatcher.lookup(&message_type) else {
            tracing::warn!(message_type = %message_type, "no action registered for message type");
            return Ok(Some(Self::error(&message_type, "no registered handler")));
        };

        match msg.message_direct {
            MsgDirect::Request => match action.receive(msg).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    tracing::warn!(message_type = %message_type, error = %e, "receive handler failed");
                    Ok(Some(Self::error(&message_type, &e.to_string())))
                }
            },
            MsgDirect::Response => action.response(msg).await,
        }
    }

    // ── Pipeline glue ─────────────────────────────────────────────────────────

    /// Fold the logical payload into wire form before a send. A message
    /// with no payload passes through untouched.
    pub async fn encrypt_envelope(&self, msg: &mut ChainMessage) -> Result<(), PayloadError> {
        let Some(current) = msg.payload.take() else {
            return Ok(());
        };

        let params = SecurityParams {
            need_compress: msg.need_compress,
            need_encrypt: msg.need_encrypt,
            target_peer_id: resolved_target(msg),
            ..SecurityParams::default()
        };

        match payload::encrypt(&current, &params, &self.identity, self.directory.as_ref()).await {
            Ok(sealed) => {
                msg.transport_payload = sealed.transport_payload;
                msg.payload = None;
                msg.payload_signature = sealed.payload_signature;
                msg.previous_public_key_payload_signature =
                    sealed.previous_public_key_payload_signature;
                msg.need_compress = sealed.need_compress;
                msg.need_encrypt = sealed.need_encrypt;
                msg.payload_key = sealed.payload_key;
                Ok(())
            }
            Err(e) => {
                msg.payload = Some(current);
                Err(e)
            }
        }
    }

    /// Recover the logical payload after a receive. A relay (target not
    /// local) keeps the wire form for forwarding.
    pub async fn decrypt_envelope(&self, msg: &mut ChainMessage) -> Result<(), PayloadError> {
        let Some(wire) = msg.transport_payload.take() else {
            return Ok(());
        };

        let params = SecurityParams {
            need_compress: msg.need_compress,
            need_encrypt: msg.need_encrypt,
            payload_signature: msg.payload_signature.clone(),
            previous_public_key_payload_signature: msg
                .previous_public_key_payload_signature
                .clone(),
            payload_key: msg.payload_key.clone(),
            target_peer_id: resolved_target(msg),
            src_peer_id: msg.src_peer_id.clone(),
            ..SecurityParams::default()
        };

        match payload::decrypt(&wire, &params, &self.identity, self.directory.as_ref()).await? {
            Some(value) => {
                msg.payload = Some(value);
                msg.transport_payload = None;
            }
            None => {
                msg.transport_payload = Some(wire);
            }
        }
        Ok(())
    }

    // ── Control replies ───────────────────────────────────────────────────────

    pub fn ok(message_type: &str) -> ChainMessage {
        control_reply(message_type, MsgType::Ok, "OK")
    }

    pub fn wait(message_type: &str) -> ChainMessage {
        control_reply(message_type, MsgType::Wait, "WAIT")
    }

    pub fn error(message_type: &str, tip: &str) -> ChainMessage {
        control_reply(message_type, MsgType::Error, tip)
    }

    pub fn response(message_type: &str, payload: Value) -> ChainMessage {
        let mut msg = ChainMessage::new(message_type, MsgDirect::Response);
        msg.payload = Some(payload);
        msg.payload_type = Some(payload_type::MAP.into());
        msg
    }

    /// A routable request must name a hop and an origin.
    pub fn validate(msg: &ChainMessage) -> anyhow::Result<()> {
        if msg.connect_peer_id.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("envelope names no connect peer");
        }
        if msg.src_peer_id.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("envelope names no source peer");
        }
        Ok(())
    }
}

fn control_reply(message_type: &str, marker: MsgType, tip: &str) -> ChainMessage {
    let mut msg = ChainMessage::new(message_type, MsgDirect::Response);
    msg.payload = Some(Value::String(marker.as_str().into()));
    msg.tip = Some(tip.into());
    msg
}

/// The logical recipient: the final target when set, otherwise the hop.
fn resolved_target(msg: &ChainMessage) -> Option<String> {
    msg.target_peer_id
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| msg.connect_peer_id.clone().filter(|c| !c.is_empty()))
}

fn marshal_reply(msg: &ChainMessage) -> Option<Bytes> {
    match envelope::marshal(msg) {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize reply envelope");
            None
        }
    }
}

/// Split on byte positions, stepping back to a char boundary. A chunk is
/// never empty, so the walk always terminates.
fn split_frames(text: &str, frame: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + frame).min(text.len());
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = (start + 1..=text.len())
                .find(|&i| text.is_char_boundary(i))
                .unwrap_or(text.len());
        }
        chunks.push(&text[start..end]);
        start = end;
    }
    chunks
}

// ── Tests ─────────────────────────────────────────────────────────────────────
