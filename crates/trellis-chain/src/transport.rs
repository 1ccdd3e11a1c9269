//! Transport collaborator contracts.
//!
//! The message handler is agnostic to how many transports exist or how
//! destinations map to them; it only follows the routing precedence
//! (direct link → routed hop → fallback address → topic). Implementations
//! own sockets, connection pools, and retries — none of that is in scope
//! here.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;

/// What a synchronous transport round trip produced.
#[derive(Debug, Clone)]
pub struct TransportReply {
    /// Response bytes, possibly empty when the peer had nothing to say.
    pub data: Bytes,
    /// The physical peer the reply arrived from, when the transport knows it.
    pub peer_id: Option<String>,
    pub address: Option<String>,
}

/// A transport with standing connections to specific peers
/// (the original's WebRTC peer pool).
#[async_trait]
pub trait DirectLinkTransport: Send + Sync {
    async fn is_connected(&self, peer_id: &str) -> bool;

    /// Send and await one reply. `Ok(None)` means the write succeeded but
    /// no reply came back.
    async fn send(&self, peer_id: &str, data: Bytes) -> anyhow::Result<Option<TransportReply>>;
}

/// A transport that can reach any peer id through the overlay
/// (the original's libp2p stream pool).
#[async_trait]
pub trait RoutedTransport: Send + Sync {
    async fn send(
        &self,
        peer_id: &str,
        protocol_id: &str,
        data: Bytes,
    ) -> anyhow::Result<Option<TransportReply>>;
}

/// A non-P2P fallback reached by address (ws://…, http://…).
#[async_trait]
pub trait AddressTransport: Send + Sync {
    /// Whether this transport speaks the address's scheme.
    fn supports(&self, address: &str) -> bool;

    async fn send(&self, address: &str, data: Bytes) -> anyhow::Result<Option<TransportReply>>;
}

/// Publish/subscribe fan-out. Inbound topic messages arrive through the
/// same raw-receive callback as everything else, with no remote peer.
#[async_trait]
pub trait TopicBus: Send + Sync {
    async fn publish(&self, topic: &str, data: Bytes) -> anyhow::Result<()>;
}

/// The handler's explicit transport dependency. Every slot is optional;
/// an empty set routes nothing and every send yields no result.
#[derive(Clone, Default)]
pub struct TransportSet {
    pub direct: Option<Arc<dyn DirectLinkTransport>>,
    pub routed: Option<Arc<dyn RoutedTransport>>,
    pub address: Vec<Arc<dyn AddressTransport>>,
    pub topic: Option<Arc<dyn TopicBus>>,
}

/// The raw-receive callback transports invoke when data arrives:
/// `(bytes, remote_peer_id, remote_address) -> response bytes`.
///
/// Topic deliveries pass `None` for both remote fields.
pub type RawInbound =
    Arc<dyn Fn(Bytes, Option<String>, Option<String>) -> BoxFuture<'static, Option<Bytes>> + Send + Sync>;
