//! Presence-aware message gateway.
//!
//! This service:
//! - Accepts WebSocket connections, one live connection per identity
//! - Tracks per-identity presence through single-task endpoints, answerable
//!   from any process when NATS is configured
//! - Routes direct and channel messages through a per-identity fanout bus
//! - Exposes channel, friend and presence administration over HTTP
//!
//! ## Architecture
//!
//! ```text
//! admin API / inbound frame
//!         ↓
//! RoutingService ── MembershipStore (Redis or in-memory)
//!         ↓ one publish per recipient
//! FanoutBus (NATS subjects or in-process)
//!         ↓ subscription per live identity
//! ConnectionHandle → writer task → WebSocket
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod subscription;
pub mod ws_server;

pub use client::{ConnectionHandle, ConnectionId, ConnectionRegistry, ConnectionState};
pub use config::GatewayConfig;
pub use endpoint::{EndpointConfig, EndpointRuntime};
pub use error::{GatewayError, Result, RoutingError};
pub use presence::{LocalPresence, NatsPresence, PresenceDirectory};
pub use protocol::{ApiResult, ContentType, Packet, SendType};
pub use router::{RouterConfig, RoutingService};
pub use subscription::{FanoutBus, LocalFanoutBus, NatsFanoutBus, Subscription};
pub use ws_server::{create_router, AppState, SessionConfig};
