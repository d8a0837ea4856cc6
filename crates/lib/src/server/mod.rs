//! HTTP + WebSocket server (single port).
//!
//! Serves the vendor webhook, the REST snapshot, and the viewer WebSocket.
//! Viewer protocol: first request must be `connect`; then requests (req/res)
//! and server-pushed event frames.

mod protocol;
mod server;

pub use protocol::{
    ConnectParams, ConversationView, HelloOk, WsRequest, WsResponse,
};
pub use server::run_server;
