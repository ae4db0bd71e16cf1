//! Gateway: HTTP + WebSocket control plane.
//!
//! Single port serves HTTP and WebSocket. Protocol: first request must be
//! `connect`; then method requests (req/res) and server-pushed events.

pub mod clients;
pub mod protocol;
pub mod router;
pub mod server;
pub mod store;

pub use clients::ClientRegistry;
pub use protocol::{AgentEvent, AgentEventKind, TokenUsage, WsFrame, WsRequest, WsResponse};
pub use router::Router;
pub use server::run_gateway;
pub use store::SessionStore;
