//! tessera-core: session and RPC runtime for the tessera game-server framework.
//!
//! This crate defines:
//! - The promise primitive every asynchronous operation returns ([`Promise`])
//! - Session-affined workers and application executors ([`WorkerGroup`], [`Executor`])
//! - Wire packets and RPC envelopes ([`Packet`], [`Envelope`])
//! - The per-session handler chain ([`Pipeline`], [`Handler`], [`Event`])
//! - Sessions and their lifecycle ([`Session`], [`SessionConfig`], [`SessionRegistry`])
//! - Reliable delivery ([`ReliableHandler`], [`MessageQueue`])
//! - RPC correlation ([`RpcHandler`], [`Dispatcher`], [`ResponseChannel`])
//! - Handshake and resume ([`Connector`], [`Acceptor`])
//! - Transports ([`Transport`], `transport::mem`, `transport::stream`)

mod config;
mod error;
mod executor;
mod future;
mod handshake;
mod packet;
mod pipeline;
mod registry;
mod reliable;
mod rpc;
mod session;
pub mod transport;

pub use config::*;
pub use error::*;
pub use executor::*;
pub use future::*;
pub use handshake::*;
pub use packet::*;
pub use pipeline::*;
pub use registry::*;
pub use reliable::*;
pub use rpc::*;
pub use session::*;
pub use transport::Transport;
