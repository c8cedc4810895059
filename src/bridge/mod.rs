//! Bridge Tunnel (relay side) and Bridge Client (operator side): the two
//! halves of the single-tenant `/bridge` WebSocket connecting a privately
//! run agent to the relay.

pub mod client;
pub mod protocol;
pub mod tunnel;

pub use client::{AgentHandler, BridgeClient, EchoResponder};
pub use tunnel::{BridgeError, BridgeTunnel};

pub use crate::gateway::DownstreamSink;
