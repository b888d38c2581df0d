//! TCP nodes: accept and open sessions over [`StreamTransport`].

use std::io;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tessera_core::transport::stream::StreamTransport;
use tessera_core::{
    Acceptor, Connector, Payload, Session, SessionConfig, SessionError, SessionId,
    SessionRegistry, WorkerGroup,
};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A set of session workers, the sessions they own and the configuration
/// every session of this node starts with.
pub struct Node<M: Payload> {
    workers: Arc<WorkerGroup>,
    registry: SessionRegistry<M>,
    config: Arc<SessionConfig<M>>,
}

impl<M: Payload> Clone for Node<M> {
    fn clone(&self) -> Self {
        Self {
            workers: Arc::clone(&self.workers),
            registry: self.registry.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<M: Payload> std::fmt::Debug for Node<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("workers", &self.workers.len())
            .field("sessions", &self.registry.len())
            .finish()
    }
}

impl<M> Node<M>
where
    M: Payload + Serialize + DeserializeOwned,
{
    /// Start `workers` session worker threads.
    pub fn new(workers: usize, config: Arc<SessionConfig<M>>) -> io::Result<Self> {
        Ok(Self {
            workers: Arc::new(WorkerGroup::new(workers)?),
            registry: SessionRegistry::new(),
            config,
        })
    }

    pub fn registry(&self) -> &SessionRegistry<M> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<SessionConfig<M>> {
        &self.config
    }

    pub fn workers(&self) -> &Arc<WorkerGroup> {
        &self.workers
    }

    pub fn acceptor(&self) -> Acceptor<M> {
        Acceptor::new(
            Arc::clone(&self.workers),
            self.registry.clone(),
            Arc::clone(&self.config),
        )
    }

    /// Accept connections until the listener fails. Each connection is
    /// handshaken on its own task.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(%local, "node listening");
        let acceptor = self.acceptor();

        loop {
            let (socket, peer_addr) = listener.accept().await?;
            if let Err(e) = socket.set_nodelay(true) {
                tracing::debug!(%peer_addr, error = %e, "failed to set TCP_NODELAY");
            }
            tracing::debug!(%peer_addr, "connection accepted");

            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor.accept(StreamTransport::new(socket)).await {
                    Ok(session) => {
                        tracing::debug!(%peer_addr, session_id = %session.id(), "handshake complete");
                    }
                    Err(e) => {
                        tracing::warn!(%peer_addr, error = %e, "handshake failed");
                    }
                }
            });
        }
    }

    /// Open a session to a remote node.
    pub async fn connect(
        &self,
        addr: impl ToSocketAddrs,
        session_id: impl Into<SessionId>,
    ) -> Result<Session<M>, NodeError> {
        let session = Session::new(
            session_id,
            Arc::clone(&self.config),
            &self.workers,
            Some(&self.registry),
        )?;
        match self.handshake(&session, addr).await {
            Ok(_) => Ok(session),
            Err(e) => {
                session.close_forcibly();
                Err(e)
            }
        }
    }

    /// Re-establish the transport of an active session. Returns whether the
    /// remote resumed it; if it did not, the session is closed.
    pub async fn resume(
        &self,
        session: &Session<M>,
        addr: impl ToSocketAddrs,
    ) -> Result<bool, NodeError> {
        if session.is_closed() {
            return Err(SessionError::Closed.into());
        }
        self.handshake(session, addr).await
    }

    async fn handshake(
        &self,
        session: &Session<M>,
        addr: impl ToSocketAddrs,
    ) -> Result<bool, NodeError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let resumed = Connector::connect(session, StreamTransport::new(stream)).await?;
        tracing::info!(session_id = %session.id(), resumed, "connected");
        Ok(resumed)
    }

    /// Close every session of this node gracefully.
    pub fn shutdown(&self) {
        self.registry.close_all();
    }
}
