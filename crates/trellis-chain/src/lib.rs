//! trellis-chain — dispatch, actions, and the chain-message handler.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `action` | Per-message-type capabilities and the shared endpoint |
//! | `dispatch` | Message-type → action registry |
//! | `handler` | Encrypt/route/slice/merge orchestration |
//! | `transport` | Collaborator contracts for the transport set |

pub mod action;
pub mod dispatch;
pub mod handler;
pub mod transport;

pub use action::{
    Action, ActionEndpoint, ChatAction, ConsensusAction, FindPeerAction, Listener,
    ListenerContext, P2pChatAction, SignalAction,
};
pub use dispatch::ChainDispatcher;
pub use handler::ChainMessageHandler;
pub use transport::{
    AddressTransport, DirectLinkTransport, RawInbound, RoutedTransport, TopicBus, TransportReply,
    TransportSet,
};
