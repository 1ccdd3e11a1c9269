//! Peer lookup over the chain protocol.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use trellis_core::{ChainMessage, MsgType};

use super::{Action, ActionEndpoint};
use crate::handler::ChainMessageHandler;

pub struct FindPeerAction {
    endpoint: ActionEndpoint,
}

impl FindPeerAction {
    /// Construct and register under `FINDPEER`.
    pub fn register(handler: &Arc<ChainMessageHandler>) -> Arc<Self> {
        let action = Arc::new(Self {
            endpoint: ActionEndpoint::new(MsgType::FindPeer, handler.clone()),
        });
        handler
            .dispatcher()
            .register(MsgType::FindPeer.as_str(), action.clone());
        action
    }

    pub fn endpoint(&self) -> &ActionEndpoint {
        &self.endpoint
    }

    /// Ask a hop to locate a peer. Returns the reply payload.
    pub async fn find_peer(
        &self,
        connect_peer_id: Option<&str>,
        peer_id: &str,
    ) -> anyhow::Result<Option<Value>> {
        let msg = self
            .endpoint
            .prepare_send(connect_peer_id, json!({ "peerId": peer_id }), None);

        let response = self.endpoint.send(msg).await?;
        Ok(response.and_then(|r| r.payload))
    }
}

#[async_trait]
impl Action for FindPeerAction {
    fn message_type(&self) -> &str {
        MsgType::FindPeer.as_str()
    }

    async fn send(&self, msg: ChainMessage) -> anyhow::Result<Option<ChainMessage>> {
        self.endpoint.send(msg).await
    }

    async fn receive(&self, msg: ChainMessage) -> anyhow::Result<Option<ChainMessage>> {
        let Some(complete) = self.endpoint.merge(msg).await else {
            return Ok(None);
        };
        self.endpoint.notify_listeners(&complete);
        // Lookups are answered by whichever directory the listeners feed;
        // the protocol-level reply just acknowledges receipt.
        Ok(Some(ChainMessageHandler::ok(self.message_type())))
    }

    async fn response(&self, msg: ChainMessage) -> anyhow::Result<Option<ChainMessage>> {
        Ok(Some(msg))
    }
}
