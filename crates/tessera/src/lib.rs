//! tessera: session and RPC runtime for game servers.
//!
//! # Quick Start
//!
//! Implement a [`Dispatcher`] for your message type, build a
//! [`SessionConfig`] and run a [`Node`]:
//!
//! ```ignore
//! use tessera::prelude::*;
//!
//! #[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
//! enum Msg {
//!     Move { x: i32, y: i32 },
//!     Moved,
//! }
//!
//! struct World;
//!
//! impl Dispatcher<Msg> for World {
//!     fn post_rpc_request(&self, _session: &Session<Msg>, _msg: Msg, channel: ResponseChannel<Msg>) {
//!         channel.write(Msg::Moved);
//!     }
//!
//!     fn post_one_way_message(&self, _session: &Session<Msg>, _msg: Msg) {}
//! }
//!
//! let config = SessionConfig::builder(Arc::new(World), Arc::new(TokioExecutor::current()))
//!     .reliable(ReliableConfig::default())
//!     .resumable(true)
//!     .build();
//! let node = Node::new(4, config)?;
//! node.serve(TcpListener::bind("127.0.0.1:7000").await?).await?;
//! ```
//!
//! # Sessions
//!
//! Every session is pinned to one worker thread, chosen from its id. All of
//! its protocol state (the handler pipeline, pending calls, sequence
//! numbers) is only touched on that worker, so handlers need no locking.
//! Application code runs on the application executor, never on a worker.
//!
//! # Calls
//!
//! - [`Session::send`]: one-way message.
//! - [`Session::call`]: returns a [`Promise`] of the result.
//! - [`Session::sync_call`]: blocks an application thread; refuses to run
//!   on a worker.
//! - [`Session::call_async`]: callback on the application executor.
//!
//! Timeouts and closure are values: every call resolves exactly once with
//! `Ok(response)` or an [`RpcError`].
//!
//! # Transports
//!
//! - **mem** (default): in-process channels for tests
//! - **stream** (default): length-prefixed postcard frames over TCP or any
//!   byte stream

// Re-export core types
pub use tessera_core::{
    Acceptor,
    AffinityPolicy,
    CloseMode,
    Connector,
    Dispatcher,
    Envelope,
    Event,
    Executor,
    FaultCode,
    Handler,
    HandlerCtx,
    HandlerError,
    HandlerResult,
    HashAffinity,
    InlineExecutor,
    Job,
    Outcome,
    Packet,
    Payload,
    Pipeline,
    PipelineError,
    Promise,
    PromiseError,
    RELIABLE_HANDLER,
    ReliableConfig,
    RemoteFault,
    ResponseChannel,
    RPC_HANDLER,
    RpcError,
    RpcResult,
    SerialExecutor,
    Session,
    SessionConfig,
    SessionConfigBuilder,
    SessionCore,
    SessionError,
    SessionId,
    SessionRegistry,
    SessionState,
    TokioExecutor,
    Transport,
    TransportError,
    WorkerGroup,
};

/// Transport implementations, each behind a feature flag.
pub mod transport {
    pub use tessera_core::transport::Transport;

    #[cfg(feature = "mem")]
    pub use tessera_core::transport::mem::MemTransport;

    #[cfg(feature = "stream")]
    pub use tessera_core::transport::stream::{MAX_FRAME_SIZE, StreamTransport};
}

#[cfg(feature = "stream")]
mod node;

#[cfg(feature = "stream")]
pub use node::{Node, NodeError};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tessera::prelude::*;
/// ```
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::{
        Dispatcher, Executor, Promise, ReliableConfig, ResponseChannel, RpcError, Session,
        SessionConfig, TokioExecutor,
    };

    #[cfg(feature = "stream")]
    pub use crate::Node;

    #[cfg(feature = "stream")]
    pub use tokio::net::TcpListener;
}
