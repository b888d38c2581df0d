//! Session handle, lifecycle state machine and the per-session actor.
//!
//! # Lifecycle
//!
//! ```text
//!   Bound ──try_activate──▶ Active ──close / close_forcibly──▶ Closed
//!     │                                                          ▲
//!     └──────────────────close / close_forcibly──────────────────┘
//! ```
//!
//! `try_activate` is a single compare-and-set from `Bound`. `close` and
//! `close_forcibly` may be called from any thread in any state; the first
//! caller performs the transition and queues the teardown on the session's
//! worker, every later call is a no-op.
//!
//! # Actor
//!
//! Each session has one actor task on its worker. The actor exclusively owns
//! the pipeline (and so the reliable message queue and the pending RPC
//! calls), the transport link and the user attachment. A [`Session`] handle
//! only holds the identity, the atomic state and the command sender.
//!
//! ```text
//!   Session (any thread) ──Command──▶ actor (worker) ──▶ pipeline ──▶ writer task ──▶ transport
//!                                        ▲
//!                         reader task ───┘ Inbound / LinkLost
//! ```
//!
//! A panic inside the actor is caught; the session is then marked closed and
//! removed from its registry.

use std::any::Any;
use std::fmt;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SessionConfig;
use crate::error::{PromiseError, RpcError, RpcResult, SessionError};
use crate::executor::{WorkerGroup, is_worker_thread, panic_message};
use crate::future::Promise;
use crate::packet::{Envelope, Packet, Payload, SessionId};
use crate::pipeline::{Event, Pipeline};
use crate::registry::SessionRegistry;
use crate::reliable::ReliableHandler;
use crate::rpc::{OutboundCall, Reply, RpcHandler};
use crate::transport::Transport;

/// Pipeline name of the reliable-delivery handler.
pub const RELIABLE_HANDLER: &str = "reliable";
/// Pipeline name of the RPC correlation handler.
pub const RPC_HANDLER: &str = "rpc";

const BOUND: u8 = 0;
const ACTIVE: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Bound,
    Active,
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            BOUND => SessionState::Bound,
            ACTIVE => SessionState::Active,
            _ => SessionState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Flush what flow control allows, say goodbye, drain the writer.
    Graceful,
    /// Drop the transport at once.
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttachMode {
    /// No handshake.
    Direct,
    /// Client side: send `Handshake` and wait for the ack.
    Connect,
    /// Server side: the handshake was read already; send the ack.
    Accept { resumed: bool },
}

type LinkFactory<M> = Box<dyn FnOnce(u64, mpsc::UnboundedSender<Command<M>>) -> Link<M> + Send>;
type CoreJob<M> = Box<dyn FnOnce(&mut SessionCore<M>) + Send>;

enum Command<M: Payload> {
    Inbound {
        generation: u64,
        packet: Packet<M>,
    },
    LinkLost {
        generation: u64,
        reason: String,
    },
    Write(Event<M>),
    Attach {
        factory: LinkFactory<M>,
        mode: AttachMode,
        handshake: Option<Promise<bool>>,
    },
    Activated,
    Close {
        mode: CloseMode,
        was_active: bool,
        goodbye: bool,
    },
    Exec(CoreJob<M>),
}

struct Shared<M: Payload> {
    id: SessionId,
    state: AtomicU8,
    forced: AtomicBool,
    worker: usize,
    config: Arc<SessionConfig<M>>,
    commands: mpsc::UnboundedSender<Command<M>>,
    closed: Promise<()>,
}

/// Cloneable handle to a session.
pub struct Session<M: Payload> {
    shared: Arc<Shared<M>>,
}

impl<M: Payload> Clone for Session<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Payload> fmt::Debug for Session<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("worker", &self.shared.worker)
            .finish()
    }
}

fn build_pipeline<M: Payload>(config: &SessionConfig<M>) -> Pipeline<M> {
    let mut pipeline = Pipeline::new();
    if let Some(reliable) = config.reliable() {
        let handler = ReliableHandler::new(reliable, config.heartbeat_interval());
        if let Err(error) = pipeline.add_last(RELIABLE_HANDLER, handler) {
            tracing::error!(%error, "failed to install reliable handler");
        }
    }
    if config.rpc_enabled() {
        if let Err(error) = pipeline.add_last(RPC_HANDLER, RpcHandler::new()) {
            tracing::error!(%error, "failed to install rpc handler");
        }
    }
    if let Some(init) = config.initializer() {
        init(&mut pipeline);
    }
    pipeline
}

impl<M: Payload> Session<M> {
    /// Create a session bound to the worker its id maps to, optionally
    /// registering it, and start its actor.
    pub fn new(
        id: impl Into<SessionId>,
        config: Arc<SessionConfig<M>>,
        workers: &WorkerGroup,
        registry: Option<&SessionRegistry<M>>,
    ) -> Result<Self, SessionError> {
        let id = id.into();
        let worker = workers.select(&id);
        let (commands, rx) = mpsc::unbounded_channel();
        let session = Session {
            shared: Arc::new(Shared {
                id,
                state: AtomicU8::new(BOUND),
                forced: AtomicBool::new(false),
                worker: worker.index(),
                config: Arc::clone(&config),
                commands,
                closed: Promise::new(),
            }),
        };

        if let Some(registry) = registry {
            registry.register(session.clone())?;
        }

        let core = SessionCore {
            session: session.clone(),
            pipeline: build_pipeline(&config),
            link: None,
            generation: 0,
            attachment: None,
            last_inbound: Instant::now(),
            handshake: None,
            registry: registry.cloned(),
        };

        let guard = session.clone();
        let registry = registry.cloned();
        worker.handle().spawn(async move {
            if let Err(panic) = AssertUnwindSafe(core.run(rx)).catch_unwind().await {
                tracing::error!(
                    session_id = %guard.id(),
                    message = %panic_message(panic.as_ref()),
                    "session actor panicked"
                );
                guard.shared.state.store(CLOSED, Ordering::Release);
                if let Some(registry) = registry {
                    registry.remove_exact(&guard);
                }
                guard.shared.closed.try_failure(SessionError::Closed);
            }
        });

        tracing::debug!(session_id = %session.id(), worker = worker.index(), "session created");
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Index of the worker this session is bound to.
    pub fn worker_index(&self) -> usize {
        self.shared.worker
    }

    pub fn config(&self) -> &SessionConfig<M> {
        &self.shared.config
    }

    pub(crate) fn same_session(&self, other: &Session<M>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn submit(&self, command: Command<M>) -> Result<(), Command<M>> {
        self.shared.commands.send(command).map_err(|e| e.0)
    }

    fn reject(&self, command: Command<M>) {
        match command {
            Command::Write(Event::Call(call)) => {
                call.reply.resolve(Err(RpcError::SessionClosed), self.config());
            }
            Command::Attach {
                handshake: Some(promise),
                ..
            } => {
                promise.try_failure(SessionError::Closed);
            }
            _ => {}
        }
    }

    /// Move `Bound -> Active`. Returns `false` if the session was not bound.
    pub fn try_activate(&self) -> bool {
        let activated = self
            .shared
            .state
            .compare_exchange(BOUND, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if activated {
            tracing::debug!(session_id = %self.id(), "session activated");
            if let Err(command) = self.submit(Command::Activated) {
                self.reject(command);
            }
        }
        activated
    }

    /// Close gracefully. Returns `true` for the call that performed the
    /// transition.
    pub fn close(&self) -> bool {
        self.close_with(CloseMode::Graceful, true)
    }

    /// Close without flushing or saying goodbye.
    pub fn close_forcibly(&self) -> bool {
        self.close_with(CloseMode::Forced, false)
    }

    pub(crate) fn close_with(&self, mode: CloseMode, goodbye: bool) -> bool {
        let mut current = self.shared.state.load(Ordering::Acquire);
        loop {
            if current == CLOSED {
                return false;
            }
            match self.shared.state.compare_exchange_weak(
                current,
                CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if mode == CloseMode::Forced {
            self.shared.forced.store(true, Ordering::Release);
        }

        let was_active = current == ACTIVE;
        tracing::debug!(session_id = %self.id(), ?mode, was_active, "session closing");
        let command = Command::Close {
            mode,
            was_active,
            goodbye,
        };
        if self.submit(command).is_err() {
            self.shared.closed.try_success(());
        }
        true
    }

    /// Completes once the close teardown has run on the worker.
    pub fn close_future(&self) -> Promise<()> {
        self.shared.closed.clone()
    }

    /// Inject an outbound event at the pipeline tail.
    ///
    /// Calls are accepted in any state. Everything else needs an active
    /// session: `Bound` yields [`SessionError::NotActive`].
    pub fn write(&self, event: Event<M>) -> Result<(), SessionError> {
        if let Event::Call(call) = event {
            self.submit_call(call);
            return Ok(());
        }
        match self.state() {
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Bound => return Err(SessionError::NotActive),
            SessionState::Active => {}
        }
        self.submit(Command::Write(event))
            .map_err(|_| SessionError::Closed)
    }

    /// Send a one-way message.
    pub fn send(&self, payload: M) -> Result<(), SessionError> {
        self.write(Event::Message(payload))
    }

    /// Release buffered reliable traffic now.
    pub fn flush(&self) -> Result<(), SessionError> {
        self.write(Event::Flush)
    }

    fn submit_call(&self, call: OutboundCall<M>) {
        if self.is_closed() {
            call.reply
                .resolve(Err(RpcError::SessionClosed), self.config());
            return;
        }
        if let Err(command) = self.submit(Command::Write(Event::Call(call))) {
            self.reject(command);
        }
    }

    /// Issue a synchronous-flagged call and return its promise. The result
    /// is a value: timeouts and closure arrive as `Err(RpcError)`.
    pub fn call(&self, payload: M) -> Promise<RpcResult<M>> {
        let promise = Promise::new();
        self.submit_call(OutboundCall {
            payload,
            sync: true,
            reply: Reply::Promise(promise.clone()),
        });
        promise
    }

    /// Block the calling application thread until the call resolves.
    ///
    /// On a session worker this returns [`RpcError::WouldBlockWorker`]
    /// instead of deadlocking the worker that would deliver the response.
    pub fn sync_call(&self, payload: M) -> RpcResult<M> {
        if is_worker_thread() {
            return Err(RpcError::WouldBlockWorker);
        }
        let config = self.config();
        // The sweep resolves the call; the grace period only covers a
        // worker that stopped ticking.
        let wait = config.sync_rpc_timeout() + config.tick_interval() * 2;
        match self.call(payload).get_timeout(wait) {
            Ok(result) => result,
            Err(PromiseError::Timeout) => Err(RpcError::Timeout),
            Err(_) => Err(RpcError::SessionClosed),
        }
    }

    /// Issue an asynchronous call. `callback` runs exactly once on the
    /// application executor.
    pub fn call_async<F>(&self, payload: M, callback: F)
    where
        F: FnOnce(RpcResult<M>) + Send + 'static,
    {
        self.submit_call(OutboundCall {
            payload,
            sync: false,
            reply: Reply::Callback(Box::new(callback)),
        });
    }

    pub(crate) fn write_response(&self, response: Envelope<M>, flush: bool) {
        if self.is_closed() && self.shared.forced.load(Ordering::Acquire) {
            tracing::trace!(session_id = %self.id(), "response after close; dropped");
            return;
        }
        if self.submit(Command::Write(Event::Envelope(response))).is_err() {
            tracing::trace!(session_id = %self.id(), "response after close; dropped");
            return;
        }
        if flush {
            let _ = self.submit(Command::Write(Event::Flush));
        }
    }

    /// Run `job` on the session's worker with exclusive access to its core.
    pub fn execute<F>(&self, job: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut SessionCore<M>) + Send + 'static,
    {
        self.submit(Command::Exec(Box::new(job)))
            .map_err(|_| SessionError::Closed)
    }

    /// Mutate the pipeline on the session's worker.
    pub fn modify_pipeline<F>(&self, f: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut Pipeline<M>) + Send + 'static,
    {
        self.execute(move |core| f(&mut core.pipeline))
    }

    /// Attach a transport without a handshake. Attaching to an active
    /// session counts as a reconnect.
    pub fn attach<T: Transport<M>>(&self, transport: T) {
        self.attach_with(transport, AttachMode::Direct, None);
    }

    /// Attach a transport and perform the client side of the handshake.
    ///
    /// The promise yields whether the server resumed an existing session.
    pub fn connect<T: Transport<M>>(&self, transport: T) -> Promise<bool> {
        let promise = Promise::new();
        self.attach_with(transport, AttachMode::Connect, Some(promise.clone()));
        promise
    }

    pub(crate) fn attach_with<T: Transport<M>>(
        &self,
        transport: T,
        mode: AttachMode,
        handshake: Option<Promise<bool>>,
    ) {
        let transport = Arc::new(transport);
        let factory: LinkFactory<M> =
            Box::new(move |generation, commands| Link::spawn(transport, generation, commands));
        let command = Command::Attach {
            factory,
            mode,
            handshake,
        };
        if let Err(command) = self.submit(command) {
            self.reject(command);
        }
    }
}

/// The transport currently attached to a session.
struct Link<M> {
    generation: u64,
    tx: mpsc::UnboundedSender<Packet<M>>,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl<M: Payload> Link<M> {
    /// Spawn reader and writer tasks on the current (worker) runtime.
    fn spawn<T: Transport<M>>(
        transport: Arc<T>,
        generation: u64,
        commands: mpsc::UnboundedSender<Command<M>>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Packet<M>>();

        let writer = {
            let transport = Arc::clone(&transport);
            let commands = commands.clone();
            tokio::spawn(async move {
                while let Some(packet) = rx.recv().await {
                    if let Err(error) = transport.send(packet).await {
                        let _ = commands.send(Command::LinkLost {
                            generation,
                            reason: error.to_string(),
                        });
                        return;
                    }
                }
                transport.close();
            })
        };

        let reader = tokio::spawn(async move {
            loop {
                match transport.recv().await {
                    Ok(packet) => {
                        if commands
                            .send(Command::Inbound { generation, packet })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(error) => {
                        let _ = commands.send(Command::LinkLost {
                            generation,
                            reason: error.to_string(),
                        });
                        break;
                    }
                }
            }
        });

        Self {
            generation,
            tx,
            reader: reader.abort_handle(),
            writer: writer.abort_handle(),
        }
    }

    /// Stop reading; the writer drains what is queued and closes the
    /// transport.
    fn finish(self) {
        self.reader.abort();
    }

    fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

struct PendingHandshake {
    promise: Promise<bool>,
    deadline: Instant,
}

/// Session state owned by the actor. Reachable from [`Session::execute`].
pub struct SessionCore<M: Payload> {
    session: Session<M>,
    pipeline: Pipeline<M>,
    link: Option<Link<M>>,
    generation: u64,
    attachment: Option<Box<dyn Any + Send>>,
    last_inbound: Instant,
    handshake: Option<PendingHandshake>,
    registry: Option<SessionRegistry<M>>,
}

impl<M: Payload> SessionCore<M> {
    pub fn session(&self) -> &Session<M> {
        &self.session
    }

    pub fn pipeline(&self) -> &Pipeline<M> {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline<M> {
        &mut self.pipeline
    }

    /// Whether a transport is attached right now.
    pub fn is_linked(&self) -> bool {
        self.link.is_some()
    }

    pub fn attachment<T: Any>(&self) -> Option<&T> {
        self.attachment.as_ref()?.downcast_ref()
    }

    pub fn attachment_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.attachment.as_mut()?.downcast_mut()
    }

    /// Replace the attachment, returning the previous one.
    pub fn set_attachment<T: Any + Send>(&mut self, value: T) -> Option<Box<dyn Any + Send>> {
        self.attachment.replace(Box::new(value))
    }

    pub fn take_attachment(&mut self) -> Option<Box<dyn Any + Send>> {
        self.attachment.take()
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command<M>>) {
        let mut ticker = tokio::time::interval(self.session.config().tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => ControlFlow::Break(()),
                },
                _ = ticker.tick() => {
                    self.on_tick();
                    ControlFlow::Continue(())
                }
            };
            if flow.is_break() {
                break;
            }
        }

        commands.close();
        while let Ok(command) = commands.try_recv() {
            self.session.reject(command);
        }
        tracing::trace!(session_id = %self.session.id(), "session actor stopped");
    }

    fn handle(&mut self, command: Command<M>) -> ControlFlow<()> {
        match command {
            Command::Inbound { generation, packet } => self.on_inbound(generation, packet),
            Command::LinkLost { generation, reason } => self.on_link_lost(generation, &reason),
            Command::Write(event) => self.on_write(event),
            Command::Attach {
                factory,
                mode,
                handshake,
            } => self.on_attach(factory, mode, handshake),
            Command::Activated => {
                self.last_inbound = Instant::now();
                let out = self.pipeline.fire_active(&self.session);
                self.transmit(out);
            }
            Command::Exec(job) => {
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| job(self))) {
                    tracing::error!(
                        session_id = %self.session.id(),
                        message = %panic_message(panic.as_ref()),
                        "session job panicked"
                    );
                }
            }
            Command::Close {
                mode,
                was_active,
                goodbye,
            } => {
                self.teardown(mode, was_active, goodbye);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn transmit(&mut self, packets: Vec<Packet<M>>) {
        if packets.is_empty() {
            return;
        }
        match &self.link {
            Some(link) => {
                for packet in packets {
                    if link.tx.send(packet).is_err() {
                        break;
                    }
                }
            }
            None => {
                tracing::trace!(
                    session_id = %self.session.id(),
                    count = packets.len(),
                    "no transport attached; packets dropped"
                );
            }
        }
    }

    fn current_link(&self, generation: u64) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.generation == generation)
    }

    fn on_write(&mut self, event: Event<M>) {
        if self.session.is_closed() && self.session.shared.forced.load(Ordering::Acquire) {
            if let Event::Call(call) = event {
                call.reply
                    .resolve(Err(RpcError::SessionClosed), self.session.config());
            }
            return;
        }
        let out = self.pipeline.fire_write(&self.session, event);
        self.transmit(out);
    }

    fn on_inbound(&mut self, generation: u64, packet: Packet<M>) {
        if !self.current_link(generation) {
            tracing::trace!(session_id = %self.session.id(), generation, "packet from stale link dropped");
            return;
        }
        if self.session.is_closed() {
            return;
        }
        self.last_inbound = Instant::now();

        let out = match packet {
            Packet::HandshakeAck { resumed } => {
                self.on_handshake_ack(resumed);
                return;
            }
            Packet::Handshake { session_id } => {
                tracing::warn!(session_id = %self.session.id(), peer_id = %session_id, "unexpected handshake on established link");
                return;
            }
            Packet::Goodbye => {
                tracing::debug!(session_id = %self.session.id(), "peer said goodbye");
                self.session.close_with(CloseMode::Graceful, false);
                return;
            }
            Packet::Direct(envelope) => self
                .pipeline
                .fire_read(&self.session, Event::Envelope(envelope)),
            other => self.pipeline.fire_read(&self.session, Event::Packet(other)),
        };
        self.transmit(out);
    }

    fn on_handshake_ack(&mut self, resumed: bool) {
        let Some(pending) = self.handshake.take() else {
            tracing::debug!(session_id = %self.session.id(), "unsolicited handshake ack ignored");
            return;
        };

        match self.session.state() {
            SessionState::Bound => {
                self.session.try_activate();
            }
            SessionState::Active if resumed => {
                let out = self.pipeline.fire_read(&self.session, Event::Reconnected);
                self.transmit(out);
            }
            SessionState::Active => {
                tracing::warn!(session_id = %self.session.id(), "server did not resume the session; closing");
                pending.promise.try_failure(SessionError::Handshake(
                    "server did not resume the session".to_string(),
                ));
                self.session.close_forcibly();
                return;
            }
            SessionState::Closed => {}
        }
        pending.promise.try_success(resumed);
    }

    fn on_attach(&mut self, factory: LinkFactory<M>, mode: AttachMode, handshake: Option<Promise<bool>>) {
        if self.session.is_closed() {
            if let Some(promise) = handshake {
                promise.try_failure(SessionError::Closed);
            }
            return;
        }

        if let Some(old) = self.link.take() {
            tracing::debug!(session_id = %self.session.id(), generation = old.generation, "replacing transport");
            old.abort();
        }
        if let Some(stale) = self.handshake.take() {
            stale.promise.try_failure(SessionError::Handshake(
                "superseded by a new transport".to_string(),
            ));
        }

        self.generation += 1;
        let link = factory(self.generation, self.session.shared.commands.clone());
        let now = Instant::now();
        self.last_inbound = now;

        let first = match mode {
            AttachMode::Direct => None,
            AttachMode::Connect => Some(Packet::Handshake {
                session_id: self.session.id().to_string(),
            }),
            AttachMode::Accept { resumed } => Some(Packet::HandshakeAck { resumed }),
        };
        if let Some(packet) = first {
            let _ = link.tx.send(packet);
        }
        self.link = Some(link);
        tracing::debug!(session_id = %self.session.id(), generation = self.generation, ?mode, "transport attached");

        match mode {
            AttachMode::Connect => {
                let promise = handshake.unwrap_or_else(Promise::void);
                self.handshake = Some(PendingHandshake {
                    promise,
                    deadline: now + self.session.config().handshake_timeout(),
                });
            }
            AttachMode::Accept { resumed: true } => self.reconnected(),
            AttachMode::Direct if self.session.is_active() => self.reconnected(),
            _ => {}
        }
    }

    fn reconnected(&mut self) {
        let out = self.pipeline.fire_read(&self.session, Event::Reconnected);
        self.transmit(out);
    }

    fn on_link_lost(&mut self, generation: u64, reason: &str) {
        if !self.current_link(generation) {
            return;
        }
        if let Some(link) = self.link.take() {
            link.abort();
        }
        if self.session.is_closed() {
            return;
        }
        if let Some(pending) = self.handshake.take() {
            pending
                .promise
                .try_failure(SessionError::Handshake(reason.to_string()));
        }

        if self.session.config().resumable() && self.session.is_active() {
            tracing::info!(session_id = %self.session.id(), %reason, "transport lost; awaiting resume");
        } else {
            tracing::info!(session_id = %self.session.id(), %reason, "transport lost; closing");
            self.session.close_forcibly();
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();

        let handshake_expired = self
            .handshake
            .as_ref()
            .is_some_and(|pending| now >= pending.deadline);
        if handshake_expired {
            if let Some(pending) = self.handshake.take() {
                pending.promise.try_failure(SessionError::HandshakeTimeout);
            }
            tracing::warn!(session_id = %self.session.id(), "handshake timed out");
            if self.session.state() == SessionState::Bound {
                self.session.close_forcibly();
            }
        }

        if self.session.is_closed() {
            return;
        }
        // Bound sessions tick too, so calls issued before activation time out.
        let out = self.pipeline.fire_tick(&self.session);
        self.transmit(out);
        if !self.session.is_active() {
            return;
        }

        let idle: Duration = now.saturating_duration_since(self.last_inbound);
        if idle > self.session.config().session_timeout() {
            tracing::info!(
                session_id = %self.session.id(),
                ?idle,
                "session idle past timeout; closing"
            );
            self.session.close_forcibly();
        }
    }

    fn teardown(&mut self, mode: CloseMode, was_active: bool, goodbye: bool) {
        let session = self.session.clone();

        match mode {
            CloseMode::Graceful => {
                if was_active {
                    let out = self.pipeline.fire_close(&session);
                    self.transmit(out);
                    if goodbye {
                        self.transmit(vec![Packet::Goodbye]);
                    }
                }
                if let Some(link) = self.link.take() {
                    link.finish();
                }
            }
            CloseMode::Forced => {
                if let Some(link) = self.link.take() {
                    link.abort();
                }
            }
        }

        // Runs from Bound too: calls issued before activation must resolve.
        let out = self.pipeline.fire_inactive(&session);
        if !out.is_empty() {
            tracing::trace!(session_id = %session.id(), count = out.len(), "packets after close dropped");
        }

        if let Some(pending) = self.handshake.take() {
            pending.promise.try_failure(SessionError::Closed);
        }
        if let Some(registry) = &self.registry {
            registry.remove_exact(&session);
        }
        session.shared.closed.try_success(());
        tracing::info!(session_id = %session.id(), ?mode, was_active, "session closed");
    }
}

#[cfg(test)]
impl<M: Payload> Session<M> {
    /// A handle with no actor behind it. Commands are discarded.
    pub(crate) fn detached(id: &str, config: Arc<SessionConfig<M>>) -> Self {
        let (commands, _rx) = mpsc::unbounded_channel();
        Session {
            shared: Arc::new(Shared {
                id: id.to_string(),
                state: AtomicU8::new(ACTIVE),
                forced: AtomicBool::new(false),
                worker: 0,
                config,
                commands,
                closed: Promise::new(),
            }),
        }
    }
}
