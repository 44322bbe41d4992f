//! Paired companion devices: persistent pairing records and the TCP bridge
//! they connect through.

mod bridge;
mod store;

pub use bridge::{
    advertise_bridge, BridgeFrame, NodeBridge, OperatorPrompt, PairRequest, PAIRING_PROMPT_TIMEOUT,
};
pub use store::{generate_token, NodeStore, NodeView, PairedNode};
