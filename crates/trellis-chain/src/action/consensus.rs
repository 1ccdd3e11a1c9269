//! Consensus-round routing.
//!
//! One action owns the whole consensus family — the generic round types
//! plus the raft and pbft flavors and their replies. Only the message
//! *types* are routed here; the consensus algorithm itself lives with the
//! application listeners.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use trellis_core::envelope::payload_type;
use trellis_core::{ChainMessage, MsgType};

use super::{Action, ActionEndpoint};
use crate::handler::ChainMessageHandler;

/// The message types this action answers for.
pub const CONSENSUS_TYPES: [MsgType; 6] = [
    MsgType::Consensus,
    MsgType::ConsensusRaft,
    MsgType::ConsensusPbft,
    MsgType::ConsensusReply,
    MsgType::ConsensusRaftReply,
    MsgType::ConsensusPbftReply,
];

pub struct ConsensusAction {
    endpoint: ActionEndpoint,
}

impl ConsensusAction {
    /// Construct and register under every consensus type.
    pub fn register(handler: &Arc<ChainMessageHandler>) -> Arc<Self> {
        let action = Arc::new(Self {
            endpoint: ActionEndpoint::new(MsgType::Consensus, handler.clone()),
        });
        for msg_type in CONSENSUS_TYPES {
            handler
                .dispatcher()
                .register(msg_type.as_str(), action.clone());
        }
        action
    }

    pub fn endpoint(&self) -> &ActionEndpoint {
        &self.endpoint
    }

    /// Send a data block into a consensus round. `msg_type` selects the
    /// flavor; absent means the generic `CONSENSUS` round.
    pub async fn consensus(
        &self,
        connect_peer_id: Option<&str>,
        msg_type: Option<MsgType>,
        data_block: Value,
    ) -> anyhow::Result<Option<Value>> {
        let mut msg = self.endpoint.prepare_send(connect_peer_id, data_block, None);
        msg.message_type = msg_type.unwrap_or(MsgType::Consensus).as_str().into();
        msg.payload_type = Some(payload_type::DATA_BLOCK.into());

        let response = self.endpoint.send(msg).await?;
        Ok(response.and_then(|r| r.payload))
    }
}

#[async_trait]
impl Action for ConsensusAction {
    fn message_type(&self) -> &str {
        MsgType::Consensus.as_str()
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
