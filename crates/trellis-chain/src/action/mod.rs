//! Actions — application capabilities bound to message types.
//!
//! Every action owns exactly one message type (or a small family, see
//! [`ConsensusAction`]) and registers its send/receive/response behavior in the
//! [`ChainDispatcher`](crate::dispatch::ChainDispatcher) at construction.
//! The shared mechanics — envelope preparation, slice fan-out with
//! response merging, reassembly, listener fan-out — live in
//! [`ActionEndpoint`], which concrete actions embed.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

use trellis_core::envelope::payload_type;
use trellis_core::{ChainMessage, MsgDirect, MsgType};

use crate::handler::ChainMessageHandler;

mod chat;
mod consensus;
mod find_peer;
mod p2p_chat;
mod signal;

pub use chat::ChatAction;
pub use consensus::ConsensusAction;
pub use find_peer::FindPeerAction;
pub use p2p_chat::P2pChatAction;
pub use signal::SignalAction;

// ── Contract ──────────────────────────────────────────────────────────────────

/// Per-message-type behavior, dispatched by the message handler.
#[async_trait]
pub trait Action: Send + Sync {
    /// The primary message-type tag this action is registered under.
    fn message_type(&self) -> &str;

    /// Actively send a prepared envelope, slicing as needed.
    async fn send(&self, msg: ChainMessage) -> anyhow::Result<Option<ChainMessage>>;

    /// Handle an inbound request. `Ok(None)` sends no reply — either the
    /// message was consumed or more slices are expected.
    async fn receive(&self, msg: ChainMessage) -> anyhow::Result<Option<ChainMessage>>;

    /// Handle an inbound response. The default for most actions is
    /// identity: hand the envelope back to the waiting sender.
    async fn response(&self, msg: ChainMessage) -> anyhow::Result<Option<ChainMessage>>;
}

// ── Listeners ─────────────────────────────────────────────────────────────────

/// What a listener sees: the decoded domain payload plus the origin peer
/// for actions (signaling) that need to correlate.
#[derive(Debug, Clone)]
pub struct ListenerContext {
    pub src_peer_id: Option<String>,
    pub payload: Value,
}

/// A named application callback, invoked per reassembled inbound request.
pub type Listener = Arc<dyn Fn(ListenerContext) -> BoxFuture<'static, ()> + Send + Sync>;

// ── Endpoint ──────────────────────────────────────────────────────────────────

/// The shared half of every action.
pub struct ActionEndpoint {
    message_type: MsgType,
    handler: Arc<ChainMessageHandler>,
    listeners: DashMap<String, Listener>,
}

impl ActionEndpoint {
    pub fn new(message_type: MsgType, handler: Arc<ChainMessageHandler>) -> Self {
        Self {
            message_type,
            handler,
            listeners: DashMap::new(),
        }
    }

    pub fn message_type(&self) -> MsgType {
        self.message_type
    }

    pub fn handler(&self) -> &Arc<ChainMessageHandler> {
        &self.handler
    }

    /// Register a named listener. Returns false (and keeps the existing
    /// one) when the name is already taken.
    pub fn register_listener(&self, name: impl Into<String>, listener: Listener) -> bool {
        match self.listeners.entry(name.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(listener);
                true
            }
        }
    }

    pub fn unregister_listener(&self, name: &str) -> bool {
        self.listeners.remove(name).is_some()
    }

    /// Build a request envelope. An absent hop falls back to the first
    /// configured connect peer.
    pub fn prepare_send(
        &self,
        connect_peer_id: Option<&str>,
        data: Value,
        target_peer_id: Option<&str>,
    ) -> ChainMessage {
        let mut msg = ChainMessage::new(self.message_type.as_str(), MsgDirect::Request);
        msg.connect_peer_id = connect_peer_id
            .map(String::from)
            .or_else(|| self.handler.config().network.connect_peers.first().cloned());
        msg.target_peer_id = target_peer_id.map(String::from);
        msg.payload = Some(data);
        msg.payload_type = Some(payload_type::MAP.into());
        msg.need_compress = true;
        msg.need_encrypt = false;
        msg
    }

    /// Send, slicing when needed. The slices of one message go out
    /// concurrently; their replies are gathered all-or-none and merged
    /// into a single response carrying the first reply's correlation
    /// metadata and the ordered payload collection.
    pub async fn send(&self, msg: ChainMessage) -> anyhow::Result<Option<ChainMessage>> {
        let mut slices = self.handler.slice(msg);
        if slices.len() == 1 {
            let only = slices.remove(0);
            return self.handler.send(only).await;
        }

        let sends = slices.into_iter().map(|slice| self.handler.send(slice));
        let results = futures::future::join_all(sends).await;

        let mut responses = Vec::new();
        for result in results {
            match result {
                Ok(Some(response)) => responses.push(response),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "slice send failed"),
            }
        }

        if responses.len() > 1 {
            let payloads: Vec<Value> = responses
                .iter()
                .map(|r| r.payload.clone().unwrap_or(Value::Null))
                .collect();
            let mut merged = responses.remove(0);
            merged.payload = Some(Value::Array(payloads));
            return Ok(Some(merged));
        }
        Ok(None)
    }

    /// Reassemble one inbound slice. `None` until the set is complete.
    pub async fn merge(&self, msg: ChainMessage) -> Option<ChainMessage> {
        self.handler.merge(msg).await
    }

    /// Fan a reassembled request out to every registered listener, each
    /// as its own task. One listener failing or panicking never blocks
    /// delivery to the others.
    pub fn notify_listeners(&self, msg: &ChainMessage) {
        for entry in self.listeners.iter() {
            let listener = entry.value().clone();
            let context = ListenerContext {
                src_peer_id: msg.src_peer_id.clone(),
                payload: msg.payload.clone().unwrap_or(Value::Null),
            };
            tokio::spawn(async move {
                listener(context).await;
            });
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
