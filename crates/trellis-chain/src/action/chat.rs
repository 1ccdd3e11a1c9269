//! Chat — encrypted application messaging over the chain protocol.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use trellis_core::{ChainMessage, MsgType};

use super::{Action, ActionEndpoint};
use crate::handler::ChainMessageHandler;

pub struct ChatAction {
    endpoint: ActionEndpoint,
}

impl ChatAction {
    /// Construct and register under `CHAT`.
    pub fn register(handler: &Arc<ChainMessageHandler>) -> Arc<Self> {
        let action = Arc::new(Self {
            endpoint: ActionEndpoint::new(MsgType::Chat, handler.clone()),
        });
        handler
            .dispatcher()
            .register(MsgType::Chat.as_str(), action.clone());
        action
    }

    pub fn endpoint(&self) -> &ActionEndpoint {
        &self.endpoint
    }

    /// Send a chat payload, end-to-end encrypted, and return the reply
    /// payload if one comes back.
    pub async fn chat(
        &self,
        connect_peer_id: Option<&str>,
        data: Value,
        target_peer_id: Option<&str>,
    ) -> anyhow::Result<Option<Value>> {
        let mut msg = self.endpoint.prepare_send(connect_peer_id, data, target_peer_id);
        msg.need_encrypt = true;

        let response = self.endpoint.send(msg).await?;
        Ok(response.and_then(|r| r.payload))
    }
}

#[async_trait]
impl Action for ChatAction {
    fn message_type(&self) -> &str {
        MsgType::Chat.as_str()
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
