//! Transport trait and adapters.
//!
//! A transport moves whole [`Packet`]s. Each adapter lives in its own module
//! under `transport/`. A session spawns one reader task and one writer task
//! per attached transport, both on the session's worker, sharing the
//! transport through an `Arc`.

use std::future::Future;

use crate::error::TransportError;
use crate::packet::Packet;

pub trait Transport<M>: Send + Sync + 'static {
    /// Send one packet. Fails with [`TransportError::Closed`] after `close`.
    fn send(&self, packet: Packet<M>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next packet. Fails with [`TransportError::Closed`] once
    /// either side has closed.
    fn recv(&self) -> impl Future<Output = Result<Packet<M>, TransportError>> + Send;

    /// Close this end. Pending and future `recv` calls on this end fail.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "stream")]
pub mod stream;
