//! Direct-link chat — like [`ChatAction`](super::ChatAction) but mandates
//! the direct peer-link transport, whose frames are much smaller, so
//! oversized payloads are sliced by default.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use trellis_core::{ChainMessage, MsgType};

use super::{Action, ActionEndpoint};
use crate::handler::ChainMessageHandler;

pub struct P2pChatAction {
    endpoint: ActionEndpoint,
}

impl P2pChatAction {
    /// Construct and register under `P2PCHAT`.
    pub fn register(handler: &Arc<ChainMessageHandler>) -> Arc<Self> {
        let action = Arc::new(Self {
            endpoint: ActionEndpoint::new(MsgType::P2pChat, handler.clone()),
        });
        handler
            .dispatcher()
            .register(MsgType::P2pChat.as_str(), action.clone());
        action
    }

    pub fn endpoint(&self) -> &ActionEndpoint {
        &self.endpoint
    }

    /// Send a chat payload straight over the peer link.
    pub async fn chat(
        &self,
        connect_peer_id: Option<&str>,
        data: Value,
        target_peer_id: Option<&str>,
    ) -> anyhow::Result<Option<Value>> {
        let mut msg = self.endpoint.prepare_send(connect_peer_id, data, target_peer_id);
        msg.need_encrypt = true;
        msg.need_slice = true;

        let response = self.endpoint.send(msg).await?;
        Ok(response.and_then(|r| r.payload))
    }
}

#[async_trait]
impl Action for P2pChatAction {
    fn message_type(&self) -> &str {
        MsgType::P2pChat.as_str()
    }

    async fn send(&self, msg: ChainMessage) -> anyhow::Result<Option<ChainMessage>> {
        self.endpoint.send(msg).await
    }

    async fn receive(&self, msg: ChainMessage) -> anyhow::Result<Option<ChainMessage>> {
        let Some(complete) = self.endpoint.merge(msg).await else {
            return Ok(None);
        };
        self.endpoint.notify_listeners(&complete);
        Ok(None)
    }

    async fn response(&self, msg: ChainMessage) -> anyhow::Result<Option<ChainMessage>> {
        Ok(Some(msg))
    }
}
