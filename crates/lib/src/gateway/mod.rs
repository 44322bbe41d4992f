//! Gateway: HTTP + WebSocket control plane.
//!
//! Single port serves a health endpoint and the WebSocket upgrade. The
//! protocol is JSON Lines: requests `{id, method, params}`, responses
//! `{id, ok, result?|error?}`, server events `{event, payload}`.

mod protocol;
mod server;

pub use protocol::{event_frame, WsRequest, WsResponse};
pub use server::{run_gateway, GatewayState, PendingPairings};
