use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::error::TransportError;
use crate::packet::{Packet, Payload};

use super::Transport;

/// Default upper bound for one encoded packet.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Length-prefixed packets over any byte stream.
///
/// Each frame is a little-endian `u32` length followed by the postcard
/// encoding of one [`Packet`].
pub struct StreamTransport<M, S> {
    reader: AsyncMutex<ReadHalf<S>>,
    writer: AsyncMutex<WriteHalf<S>>,
    closed: AtomicBool,
    shutdown: Notify,
    max_frame_size: usize,
    _payload: PhantomData<fn() -> M>,
}

impl<M, S> std::fmt::Debug for StreamTransport<M, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("max_frame_size", &self.max_frame_size)
            .finish_non_exhaustive()
    }
}

impl<M, S> StreamTransport<M, S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        Self::with_max_frame_size(stream, MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(stream: S, max_frame_size: usize) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            max_frame_size,
            _payload: PhantomData,
        }
    }
}

impl<M> StreamTransport<M, tokio::io::DuplexStream> {
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }
}

fn read_error(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(e)
    }
}

impl<M, S> StreamTransport<M, S>
where
    M: Payload + DeserializeOwned,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read_frame(&self) -> Result<Packet<M>, TransportError> {
        let mut reader = self.reader.lock().await;

        let mut len_buf = [0u8; LEN_PREFIX];
        reader.read_exact(&mut len_buf).await.map_err(read_error)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(read_error)?;
        postcard::from_bytes(&body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

impl<M, S> Transport<M> for StreamTransport<M, S>
where
    M: Payload + Serialize + DeserializeOwned,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, packet: Packet<M>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let body = postcard::to_allocvec(&packet).map_err(|e| TransportError::Encode(e.to_string()))?;
        if body.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_size,
            });
        }

        let mut frame = BytesMut::with_capacity(LEN_PREFIX + body.len());
        frame.put_u32_le(body.len() as u32);
        frame.put_slice(&body);

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Packet<M>, TransportError> {
        let shutdown = self.shutdown.notified();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            packet = self.read_frame() => packet,
            _ = shutdown => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use crate::packet::{Envelope, Sequenced};

    use super::*;

    #[tokio::test]
    async fn batch_crosses_the_stream() {
        let (a, b) = StreamTransport::<String, _>::pair();
        let batch = Packet::Batch {
            ack: 3,
            messages: vec![Sequenced {
                seq: 4,
                envelope: Envelope::OneWay("hello".to_string()),
            }],
        };
        a.send(batch.clone()).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), batch);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_on_read() {
        let (mut raw, other) = tokio::io::duplex(1024);
        let transport = StreamTransport::<String, _>::with_max_frame_size(other, 16);
        raw.write_all(&1000u32.to_le_bytes()).await.unwrap();
        assert!(matches!(
            transport.recv().await,
            Err(TransportError::FrameTooLarge { len: 1000, max: 16 })
        ));
    }

    #[tokio::test]
    async fn peer_drop_reads_as_closed() {
        let (a, b) = StreamTransport::<String, _>::pair();
        drop(a);
        assert!(matches!(b.recv().await, Err(TransportError::Closed)));
    }
}
