//! Trellis integration test harness.
//!
//! Tests here wire real handlers back-to-back over in-memory transports:
//! a send on node A lands in node B's `receive_raw`, and B's reply rides
//! the same round trip home. No sockets are involved — transport I/O is a
//! collaborator, not part of the core under test.

mod pipeline;
mod slicing;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};

use trellis_chain::{
    ChainDispatcher, ChainMessageHandler, DirectLinkTransport, RawInbound, TransportReply,
    TransportSet,
};
use trellis_core::{ChainConfig, KeyDirectory, LocalIdentity, MemoryKeyDirectory};

// ── Node fixture ──────────────────────────────────────────────────────────────

/// Build a handler for `peer_id`, publishing its keys in the shared
/// directory.
pub fn node(
    peer_id: &str,
    directory: &Arc<MemoryKeyDirectory>,
    transports: TransportSet,
    config: ChainConfig,
) -> Arc<ChainMessageHandler> {
    let identity = Arc::new(LocalIdentity::with_peer_id(peer_id));
    directory.publish(peer_id, identity.public_keys());
    let directory: Arc<dyn KeyDirectory> = directory.clone();
    Arc::new(ChainMessageHandler::new(
        identity,
        directory,
        Arc::new(ChainDispatcher::new()),
        transports,
        config,
    ))
}

/// A config with tiny frames so slicing kicks in on short strings.
pub fn tiny_frame_config(frame: usize) -> ChainConfig {
    let mut config = ChainConfig::default();
    config.slicing.routed_frame_bytes = frame;
    config.slicing.direct_frame_bytes = frame;
    config
}

// ── In-memory transports ──────────────────────────────────────────────────────

/// A direct link whose far end is another handler's raw-receive callback.
/// Optionally captures the last frame it carried, so tests can inspect
/// what actually crossed the "wire".
pub struct LoopbackDirect {
    pub local_peer_id: String,
    pub local_address: String,
    pub remote_peer_id: String,
    pub remote_address: String,
    pub connected: Vec<String>,
    pub inbound: RawInbound,
    pub last_frame: Arc<Mutex<Option<Bytes>>>,
}

impl LoopbackDirect {
    pub fn new(
        local_peer_id: &str,
        remote_peer_id: &str,
        inbound: RawInbound,
    ) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            local_address: format!("/memory/{local_peer_id}"),
            remote_peer_id: remote_peer_id.into(),
            remote_address: format!("/memory/{remote_peer_id}"),
            connected: vec![remote_peer_id.into()],
            inbound,
            last_frame: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl DirectLinkTransport for LoopbackDirect {
    async fn is_connected(&self, peer_id: &str) -> bool {
        self.connected.iter().any(|p| p == peer_id)
    }

    async fn send(&self, _peer_id: &str, data: Bytes) -> anyhow::Result<Option<TransportReply>> {
        *self.last_frame.lock().unwrap() = Some(data.clone());
        let reply = (self.inbound)(
            data,
            Some(self.local_peer_id.clone()),
            Some(self.local_address.clone()),
        )
        .await;
        Ok(reply.map(|data| TransportReply {
            data,
            peer_id: Some(self.remote_peer_id.clone()),
            address: Some(self.remote_address.clone()),
        }))
    }
}

/// A direct link that answers every send with the same canned reply.
pub struct CannedDirect {
    pub reply: Bytes,
    pub sends: Arc<Mutex<usize>>,
}

impl CannedDirect {
    pub fn new(reply: Vec<u8>) -> Self {
        Self {
            reply: Bytes::from(reply),
            sends: Arc::new(Mutex::new(0)),
        }
    }
}

#[async_trait]
impl DirectLinkTransport for CannedDirect {
    async fn is_connected(&self, _peer_id: &str) -> bool {
        true
    }

    async fn send(&self, _peer_id: &str, _data: Bytes) -> anyhow::Result<Option<TransportReply>> {
        *self.sends.lock().unwrap() += 1;
        Ok(Some(TransportReply {
            data: self.reply.clone(),
            peer_id: None,
            address: None,
        }))
    }
}

/// A direct link that fails every send.
pub struct BrokenDirect;

#[async_trait]
impl DirectLinkTransport for BrokenDirect {
    async fn is_connected(&self, _peer_id: &str) -> bool {
        true
    }

    async fn send(&self, _peer_id: &str, _data: Bytes) -> anyhow::Result<Option<TransportReply>> {
        anyhow::bail!("link torn down")
    }
}
