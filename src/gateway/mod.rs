//! Gateway: WebSocket terminal bridge and REST diagnostics
//!
//! ```text
//! browser ──ws──► websocket::Connection ──► AgentManager ──► Agent (pty)
//!    ▲                                                     │
//!    └──── Connection ◄── OutputRelay ◄── tagged events ◄──┘
//!                             │ no connection bound
//!                             ▼
//!                        SessionStore buffer
//! ```

mod auth;
mod handler;
pub mod protocol;
mod relay;
mod server;
mod websocket;

pub use auth::{AllowAll, TokenAuth, WebSocketAuth};
pub use protocol::{ClientMessage, ServerMessage};
pub use relay::{ConnectionSender, OutputRelay, RelayMessage};
pub use server::{build_router, build_transports, AppState, BridgeSettings, Gateway, GatewayState};
pub use websocket::{ConnectParams, ConnectionPhase};
