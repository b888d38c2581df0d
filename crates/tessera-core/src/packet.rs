//! Wire packets and RPC envelopes.
//!
//! A [`Packet`] is what crosses the transport. Application traffic is an
//! [`Envelope`], carried either unsequenced (`Packet::Direct`) or inside a
//! reliable [`Packet::Batch`].
//!
//! ```text
//! Packet
//! ├── Handshake { session_id }        client -> server, first packet
//! ├── HandshakeAck { resumed }        server -> client
//! ├── Batch { ack, messages }         reliable data, ack piggy-backed
//! │     └── Sequenced { seq, envelope }
//! ├── Direct(envelope)                unsequenced data
//! ├── Ping { ack } / Pong { ack }     heartbeat, bypasses the queues
//! └── Goodbye                         graceful close
//!
//! Envelope
//! ├── OneWay(payload)
//! ├── Request { id, sync, payload }
//! └── Response { id, body: Ok(payload) | Err(RemoteFault) }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::RemoteFault;

/// Bound shared by every application payload type.
///
/// The core never inspects payloads; it only clones them for retransmission
/// and moves them between threads.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

/// Session identifier assigned by the caller.
pub type SessionId = String;

/// Per-session RPC request id. The first id is 1.
pub type RequestId = u64;

/// Reliable-delivery sequence number. The first number is 1; 0 means
/// "nothing received yet" when used as an ack.
pub type Seq = u64;

/// Application-level unit of traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope<M> {
    OneWay(M),
    Request {
        id: RequestId,
        sync: bool,
        payload: M,
    },
    Response {
        id: RequestId,
        body: Result<M, RemoteFault>,
    },
}

impl<M> Envelope<M> {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::OneWay(_) => "one-way",
            Envelope::Request { .. } => "request",
            Envelope::Response { .. } => "response",
        }
    }
}

/// An envelope with its reliable-delivery sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequenced<M> {
    pub seq: Seq,
    pub envelope: Envelope<M>,
}

/// Everything that crosses a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet<M> {
    Handshake { session_id: SessionId },
    HandshakeAck { resumed: bool },
    Batch { ack: Seq, messages: Vec<Sequenced<M>> },
    Direct(Envelope<M>),
    Ping { ack: Seq },
    Pong { ack: Seq },
    Goodbye,
}

impl<M> Packet<M> {
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Handshake { .. } => "handshake",
            Packet::HandshakeAck { .. } => "handshake-ack",
            Packet::Batch { .. } => "batch",
            Packet::Direct(_) => "direct",
            Packet::Ping { .. } => "ping",
            Packet::Pong { .. } => "pong",
            Packet::Goodbye => "goodbye",
        }
    }
}
