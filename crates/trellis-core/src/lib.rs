//! trellis-core — envelope model, identity, and the security payload
//! pipeline. All other Trellis crates depend on this one.

pub mod config;
pub mod envelope;
pub mod identity;
pub mod payload;

pub use config::ChainConfig;
pub use envelope::{ChainMessage, MsgDirect, MsgType};
pub use identity::{KeyDirectory, Keypair, LocalIdentity, MemoryKeyDirectory, PeerKeys};
pub use payload::{SecurityParams, COMPRESS_LIMIT};
