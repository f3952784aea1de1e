//! Multiplexed JSON-RPC over a single persistent WebSocket.
//!
//! A [`StreamClient`] owns one connection, opened lazily or through
//! [`StreamClient::start`], optionally tunneled through a SOCKS4, SOCKS5 or
//! HTTP CONNECT proxy. Concurrent requests are correlated by id and
//! `eth_subscription` pushes are routed to the handler registered for their
//! subscription. The connection is never re-established once it closes.

mod client;
pub mod config;
mod connection;
mod error;
mod multiplexer;
mod probe;
mod subscription;
pub mod transport;

pub use client::StreamClient;
pub use config::{ClientConfig, TransportOptions};
pub use connection::ConnectionState;
pub use error::{RpcError, RpcResult};
pub use multiplexer::SubscriptionInfo;
pub use subscription::{SubscriptionEvent, SubscriptionHandler};
pub use transport::{Connector, FrameSink, FrameStream, TransportError};

pub use riptide_proto as proto;
pub use riptide_tunnel::{ProxyDescriptor, ProxyKind};
