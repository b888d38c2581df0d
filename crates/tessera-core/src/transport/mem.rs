use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};

use crate::error::TransportError;
use crate::packet::{Packet, Payload};

use super::Transport;

const CHANNEL_CAPACITY: usize = 64;

/// In-process transport over a pair of bounded channels. Packets are moved,
/// never encoded.
pub struct MemTransport<M> {
    tx: Mutex<Option<mpsc::Sender<Packet<M>>>>,
    rx: AsyncMutex<mpsc::Receiver<Packet<M>>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl<M> std::fmt::Debug for MemTransport<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTransport")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<M: Payload> MemTransport<M> {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);
        (Self::new(tx_b, rx_a), Self::new(tx_a, rx_b))
    }

    fn new(tx: mpsc::Sender<Packet<M>>, rx: mpsc::Receiver<Packet<M>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }
}

impl<M: Payload> Transport<M> for MemTransport<M> {
    async fn send(&self, packet: Packet<M>) -> Result<(), TransportError> {
        let tx = self.tx.lock().clone().ok_or(TransportError::Closed)?;
        tx.send(packet).await.map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Packet<M>, TransportError> {
        let shutdown = self.shutdown.notified();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            packet = rx.recv() => packet.ok_or(TransportError::Closed),
            _ = shutdown => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping our sender is what the peer observes as end of stream.
        self.tx.lock().take();
        self.shutdown.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packets_cross_in_order() {
        let (a, b) = MemTransport::<u32>::pair();
        a.send(Packet::Ping { ack: 1 }).await.unwrap();
        a.send(Packet::Goodbye).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Packet::Ping { ack: 1 });
        assert_eq!(b.recv().await.unwrap(), Packet::Goodbye);
    }

    #[tokio::test]
    async fn close_ends_both_directions() {
        let (a, b) = MemTransport::<u32>::pair();
        a.close();
        assert!(a.is_closed());
        assert!(matches!(a.send(Packet::Goodbye).await, Err(TransportError::Closed)));
        assert!(matches!(b.recv().await, Err(TransportError::Closed)));
    }
}
