//! Call signaling — offer/answer/candidate exchange for direct links.
//!
//! Signaling stays unencrypted: it flows before the peers hold each
//! other's keys. Listeners get the source peer alongside the payload so
//! they can correlate the round trip.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use trellis_core::{ChainMessage, MsgType};

use super::{Action, ActionEndpoint};
use crate::handler::ChainMessageHandler;

pub struct SignalAction {
    endpoint: ActionEndpoint,
}

impl SignalAction {
    /// Construct and register under `SIGNAL`.
    pub fn register(handler: &Arc<ChainMessageHandler>) -> Arc<Self> {
        let action = Arc::new(Self {
            endpoint: ActionEndpoint::new(MsgType::Signal, handler.clone()),
        });
        handler
            .dispatcher()
            .register(MsgType::Signal.as_str(), action.clone());
        action
    }

    pub fn endpoint(&self) -> &ActionEndpoint {
        &self.endpoint
    }

    /// Relay signaling data toward a peer.
    pub async fn signal(
        &self,
        connect_peer_id: Option<&str>,
        data: Value,
        target_peer_id: Option<&str>,
    ) -> anyhow::Result<Option<Value>> {
        let msg = self
            .endpoint
            .prepare_send(connect_peer_id, data, target_peer_id);

        let response = self.endpoint.send(msg).await?;
        Ok(response.and_then(|r| r.payload))
    }
}

#[async_trait]
impl Action for SignalAction {
    fn message_type(&self) -> &str {
        MsgType::Signal.as_str()
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
