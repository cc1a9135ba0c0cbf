//! Gateway protocol engine: wire frames, connection handshake and heartbeat,
//! RPC dispatch, and sequenced event broadcasting.

mod broadcaster;
mod client;
mod rpc;
mod server;
pub mod wire;

pub use broadcaster::{ConnectionRegistry, RegisteredConnection};
pub use client::{CredentialSource, GatewayClient, GatewayClientConfig, GatewayEventHandler};
pub use rpc::RpcDispatcher;
pub use server::{GatewayServer, GatewayServerConfig};
