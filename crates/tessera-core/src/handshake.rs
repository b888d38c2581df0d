//! Session establishment and resume.
//!
//! ```text
//!   client                                   server
//!     │ ── Handshake { session_id } ─────────▶ │  unknown id: new session, activate
//!     │ ◀──────────── HandshakeAck { false } ─ │
//!     │                                        │
//!     │   (transport lost, session resumable)  │
//!     │ ── Handshake { session_id } ─────────▶ │  known id: re-attach
//!     │ ◀───────────── HandshakeAck { true } ─ │  both sides fire Reconnected
//! ```
//!
//! A client that gets `HandshakeAck { resumed: false }` for a session that
//! was already active knows the server lost it, and closes forcibly.

use std::sync::Arc;

use crate::config::SessionConfig;
use crate::error::{PromiseError, SessionError};
use crate::executor::WorkerGroup;
use crate::packet::{Packet, Payload};
use crate::registry::SessionRegistry;
use crate::session::{AttachMode, Session};
use crate::transport::Transport;

fn handshake_error(error: PromiseError) -> SessionError {
    match error {
        PromiseError::Failed(cause) => match cause.downcast_ref::<SessionError>() {
            Some(SessionError::HandshakeTimeout) => SessionError::HandshakeTimeout,
            Some(SessionError::Closed) => SessionError::Closed,
            _ => SessionError::Handshake(cause.to_string()),
        },
        PromiseError::Timeout => SessionError::HandshakeTimeout,
        _ => SessionError::Closed,
    }
}

/// Client side of the handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct Connector;

impl Connector {
    /// Attach `transport` to `session` and complete the handshake. Returns
    /// whether the server resumed an existing session.
    ///
    /// A fresh session becomes active on success. The session's handshake
    /// timeout bounds the wait.
    pub async fn connect<M, T>(session: &Session<M>, transport: T) -> Result<bool, SessionError>
    where
        M: Payload,
        T: Transport<M>,
    {
        session.connect(transport).wait().await.map_err(handshake_error)
    }
}

/// Server side of the handshake.
pub struct Acceptor<M: Payload> {
    workers: Arc<WorkerGroup>,
    registry: SessionRegistry<M>,
    config: Arc<SessionConfig<M>>,
}

impl<M: Payload> Clone for Acceptor<M> {
    fn clone(&self) -> Self {
        Self {
            workers: Arc::clone(&self.workers),
            registry: self.registry.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<M: Payload> std::fmt::Debug for Acceptor<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<M: Payload> Acceptor<M> {
    pub fn new(
        workers: Arc<WorkerGroup>,
        registry: SessionRegistry<M>,
        config: Arc<SessionConfig<M>>,
    ) -> Self {
        Self {
            workers,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &SessionRegistry<M> {
        &self.registry
    }

    /// Read the peer's handshake and bind the transport to a new or resumed
    /// session.
    pub async fn accept<T: Transport<M>>(&self, transport: T) -> Result<Session<M>, SessionError> {
        let first = tokio::time::timeout(self.config.handshake_timeout(), transport.recv())
            .await
            .map_err(|_| SessionError::HandshakeTimeout)??;

        let session_id = match first {
            Packet::Handshake { session_id } => session_id,
            other => {
                transport.close();
                return Err(SessionError::Handshake(format!(
                    "expected handshake, got {}",
                    other.kind()
                )));
            }
        };

        if let Some(session) = self.registry.get(&session_id).filter(|s| !s.is_closed()) {
            tracing::info!(session_id = %session_id, "resuming session");
            session.attach_with(transport, AttachMode::Accept { resumed: true }, None);
            return Ok(session);
        }

        let session = Session::new(
            session_id,
            Arc::clone(&self.config),
            &self.workers,
            Some(&self.registry),
        )?;
        session.attach_with(transport, AttachMode::Accept { resumed: false }, None);
        session.try_activate();
        tracing::info!(session_id = %session.id(), "session accepted");
        Ok(session)
    }
}
