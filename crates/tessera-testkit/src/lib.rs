//! tessera-testkit: shared helpers and scenarios for tessera tests.
//!
//! Provides a test payload ([`TestMsg`]), a recording [`Dispatcher`], a
//! job-counting executor, a scripted raw peer and the `TransportFactory`
//! trait with shared scenarios every transport must pass.
//!
//! # Usage
//!
//! ```ignore
//! use tessera_testkit::{MemFactory, run_echo_round_trip};
//!
//! #[tokio::test]
//! async fn mem_echo() {
//!     run_echo_round_trip::<MemFactory>().await;
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tessera_core::transport::mem::MemTransport;
use tessera_core::transport::stream::StreamTransport;
use tessera_core::{
    Acceptor, Connector, Dispatcher, Executor, FaultCode, InlineExecutor, Job, Packet,
    RemoteFault, ResponseChannel, RpcError, SerialExecutor, Session, SessionConfig,
    SessionConfigBuilder, SessionError, SessionRegistry, Transport, TransportError, WorkerGroup,
};
use tracing_subscriber::EnvFilter;

pub mod bidirectional;

/// Error type for test scenarios.
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    #[error("setup error: {0}")]
    Setup(String),
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

/// Install a test-writer subscriber once per process. Filter with
/// `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Payload used across the test suites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestMsg {
    /// Request answered with the same text.
    Echo(String),
    /// Request answered with `Sum`.
    Add(i32, i32),
    Sum(i32),
    /// One-way message carrying a counter.
    Note(u64),
    /// Request that is never answered.
    Silent,
    /// Request whose response channel is dropped unanswered.
    Drop,
    /// Request answered with an `InvalidArgument` fault.
    Reject,
    /// Request the receiver answers by first calling the sender back with
    /// `Echo` of the text.
    Callback(String),
}

/// A [`Dispatcher`] that answers [`TestMsg`] requests and records one-way
/// messages.
#[derive(Default)]
pub struct RecordingDispatcher {
    messages: Mutex<Vec<TestMsg>>,
    requests: AtomicUsize,
    silent: Mutex<Vec<ResponseChannel<TestMsg>>>,
}

impl std::fmt::Debug for RecordingDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingDispatcher")
            .field("messages", &self.messages.lock().len())
            .field("requests", &self.requests())
            .finish()
    }
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<TestMsg> {
        self.messages.lock().clone()
    }

    /// Requests seen so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Poll until at least `count` one-way messages arrived.
    pub async fn wait_for_messages(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<TestMsg>, TestError> {
        let deadline = Instant::now() + timeout;
        loop {
            let messages = self.messages();
            if messages.len() >= count {
                return Ok(messages);
            }
            if Instant::now() >= deadline {
                return Err(TestError::Assertion(format!(
                    "expected {count} messages, got {}",
                    messages.len()
                )));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Dispatcher<TestMsg> for RecordingDispatcher {
    fn post_rpc_request(
        &self,
        session: &Session<TestMsg>,
        payload: TestMsg,
        channel: ResponseChannel<TestMsg>,
    ) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match payload {
            TestMsg::Echo(text) => channel.write(TestMsg::Echo(text)),
            TestMsg::Add(a, b) => channel.write(TestMsg::Sum(a + b)),
            TestMsg::Silent => self.silent.lock().push(channel),
            TestMsg::Drop => drop(channel),
            TestMsg::Reject => channel.fail(RemoteFault::new(FaultCode::InvalidArgument, "rejected")),
            TestMsg::Callback(text) => match session.sync_call(TestMsg::Echo(text)) {
                Ok(answer) => channel.write(answer),
                Err(e) => channel.fail(RemoteFault::new(FaultCode::Unavailable, e.to_string())),
            },
            other => channel.fail(RemoteFault::new(
                FaultCode::Unimplemented,
                format!("no handler for {other:?}"),
            )),
        }
    }

    fn post_one_way_message(&self, _session: &Session<TestMsg>, payload: TestMsg) {
        self.messages.lock().push(payload);
    }
}

/// Counts submitted jobs, then runs them on an inner executor.
pub struct CountingExecutor {
    inner: Arc<dyn Executor>,
    jobs: AtomicUsize,
}

impl std::fmt::Debug for CountingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingExecutor")
            .field("jobs", &self.jobs())
            .finish_non_exhaustive()
    }
}

impl CountingExecutor {
    pub fn wrap(inner: Arc<dyn Executor>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            jobs: AtomicUsize::new(0),
        })
    }

    pub fn inline() -> Arc<Self> {
        Self::wrap(Arc::new(InlineExecutor))
    }

    pub fn jobs(&self) -> usize {
        self.jobs.load(Ordering::SeqCst)
    }
}

impl Executor for CountingExecutor {
    fn execute(&self, job: Job) {
        self.jobs.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(job);
    }
}

/// Config builder with short timings suited to tests: 10 ms tick, 1 s RPC
/// timeouts, no heartbeat pings.
pub fn test_config(
    dispatcher: Arc<RecordingDispatcher>,
    executor: Arc<dyn Executor>,
) -> SessionConfigBuilder<TestMsg> {
    SessionConfig::builder(dispatcher, executor)
        .tick_interval(Duration::from_millis(10))
        .sync_rpc_timeout(Duration::from_secs(1))
        .async_rpc_timeout(Duration::from_secs(1))
        .heartbeat_interval(Duration::ZERO)
        .handshake_timeout(Duration::from_secs(2))
}

/// A serial application executor for tests that block in dispatch.
pub fn app_executor() -> Result<Arc<dyn Executor>, TestError> {
    let executor = SerialExecutor::spawn("tessera-test-app")
        .map_err(|e| TestError::Setup(format!("app executor: {e}")))?;
    Ok(Arc::new(executor))
}

/// A hand-driven peer speaking raw packets over one end of a transport.
pub struct RawPeer<T> {
    transport: T,
}

impl<T: Transport<TestMsg>> RawPeer<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub async fn send(&self, packet: Packet<TestMsg>) -> Result<(), TestError> {
        Ok(self.transport.send(packet).await?)
    }

    /// Next packet of any kind.
    pub async fn recv(&self, timeout: Duration) -> Result<Packet<TestMsg>, TestError> {
        match tokio::time::timeout(timeout, self.transport.recv()).await {
            Ok(packet) => Ok(packet?),
            Err(_) => Err(TestError::Assertion(format!(
                "no packet within {timeout:?}"
            ))),
        }
    }

    /// Next packet that is not a ping or pong.
    pub async fn recv_data(&self, timeout: Duration) -> Result<Packet<TestMsg>, TestError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.recv(left).await? {
                Packet::Ping { .. } | Packet::Pong { .. } => continue,
                packet => return Ok(packet),
            }
        }
    }

    /// Fail if a data packet arrives within `window`.
    pub async fn expect_quiet(&self, window: Duration) -> Result<(), TestError> {
        match self.recv_data(window).await {
            Ok(packet) => Err(TestError::Assertion(format!(
                "expected no traffic, got {}",
                packet.kind()
            ))),
            Err(TestError::Assertion(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn close(&self) {
        self.transport.close();
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

/// Factory trait for creating connected transport pairs.
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: Transport<TestMsg>;

    /// Returns (client_side, server_side).
    fn connect_pair()
    -> impl Future<Output = Result<(Self::Transport, Self::Transport), TestError>> + Send;
}

/// In-process channel pair.
#[derive(Debug)]
pub struct MemFactory;

impl TransportFactory for MemFactory {
    type Transport = MemTransport<TestMsg>;

    async fn connect_pair() -> Result<(Self::Transport, Self::Transport), TestError> {
        Ok(MemTransport::pair())
    }
}

/// Length-prefixed stream over an in-memory duplex pipe.
#[derive(Debug)]
pub struct StreamFactory;

impl TransportFactory for StreamFactory {
    type Transport = StreamTransport<TestMsg, tokio::io::DuplexStream>;

    async fn connect_pair() -> Result<(Self::Transport, Self::Transport), TestError> {
        Ok(StreamTransport::pair())
    }
}

/// A server (workers, registry, acceptor) and a client session connected
/// to it over one transport pair.
pub struct Harness {
    pub server_workers: Arc<WorkerGroup>,
    pub client_workers: Arc<WorkerGroup>,
    pub registry: SessionRegistry<TestMsg>,
    pub server_dispatcher: Arc<RecordingDispatcher>,
    pub client_dispatcher: Arc<RecordingDispatcher>,
    pub client: Session<TestMsg>,
    pub server: Session<TestMsg>,
}

impl Harness {
    /// Connect a client session named `session_id`. `customize` adjusts both
    /// sides' configuration.
    pub async fn connect<F, C>(session_id: &str, customize: C) -> Result<Self, TestError>
    where
        F: TransportFactory,
        C: Fn(SessionConfigBuilder<TestMsg>) -> SessionConfigBuilder<TestMsg>,
    {
        let server_workers = Arc::new(
            WorkerGroup::new(2).map_err(|e| TestError::Setup(format!("workers: {e}")))?,
        );
        let client_workers = Arc::new(
            WorkerGroup::new(1).map_err(|e| TestError::Setup(format!("workers: {e}")))?,
        );
        let registry = SessionRegistry::new();
        let server_dispatcher = RecordingDispatcher::new();
        let client_dispatcher = RecordingDispatcher::new();

        let server_config = customize(test_config(server_dispatcher.clone(), app_executor()?)).build();
        let client_config = customize(test_config(client_dispatcher.clone(), app_executor()?)).build();

        let (client_transport, server_transport) = F::connect_pair().await?;
        let acceptor = Acceptor::new(server_workers.clone(), registry.clone(), server_config);
        let accept = tokio::spawn(async move { acceptor.accept(server_transport).await });

        let client = Session::new(session_id, client_config, &client_workers, None)?;
        let resumed = Connector::connect(&client, client_transport).await?;
        if resumed {
            return Err(TestError::Assertion("fresh session reported as resumed".into()));
        }
        let server = accept
            .await
            .map_err(|e| TestError::Setup(format!("accept task: {e}")))??;

        Ok(Self {
            server_workers,
            client_workers,
            registry,
            server_dispatcher,
            client_dispatcher,
            client,
            server,
        })
    }
}

/// Unary calls: echo, arithmetic and a remote fault.
pub async fn run_echo_round_trip<F: TransportFactory>() {
    if let Err(e) = run_echo_round_trip_inner::<F>().await {
        panic!("run_echo_round_trip failed: {e}");
    }
}

async fn run_echo_round_trip_inner<F: TransportFactory>() -> Result<(), TestError> {
    init_tracing();
    let harness = Harness::connect::<F, _>("echo", |c| c).await?;
    let client = &harness.client;

    let echoed = client
        .call(TestMsg::Echo("hello".into()))
        .wait()
        .await
        .map_err(|e| TestError::Setup(e.to_string()))??;
    if echoed != TestMsg::Echo("hello".into()) {
        return Err(TestError::Assertion(format!("unexpected echo {echoed:?}")));
    }

    let sum = client
        .call(TestMsg::Add(2, 3))
        .wait()
        .await
        .map_err(|e| TestError::Setup(e.to_string()))??;
    if sum != TestMsg::Sum(5) {
        return Err(TestError::Assertion(format!("expected Sum(5), got {sum:?}")));
    }

    let rejected = client
        .call(TestMsg::Reject)
        .wait()
        .await
        .map_err(|e| TestError::Setup(e.to_string()))?;
    match rejected {
        Err(RpcError::Remote(fault)) if fault.code == FaultCode::InvalidArgument => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected InvalidArgument fault, got {other:?}"
            )));
        }
    }

    client.close();
    Ok(())
}

/// One-way messages arrive exactly once and in order.
pub async fn run_one_way_in_order<F: TransportFactory>(reliable: bool) {
    if let Err(e) = run_one_way_in_order_inner::<F>(reliable).await {
        panic!("run_one_way_in_order failed: {e}");
    }
}

async fn run_one_way_in_order_inner<F: TransportFactory>(reliable: bool) -> Result<(), TestError> {
    init_tracing();
    let harness = Harness::connect::<F, _>("one-way", |c| {
        if reliable {
            c.reliable(tessera_core::ReliableConfig {
                max_pending_messages: 4,
                ..Default::default()
            })
        } else {
            c
        }
    })
    .await?;

    const COUNT: u64 = 40;
    for n in 1..=COUNT {
        harness.client.send(TestMsg::Note(n))?;
    }
    harness.client.flush()?;

    let received = harness
        .server_dispatcher
        .wait_for_messages(COUNT as usize, Duration::from_secs(5))
        .await?;
    let expected: Vec<_> = (1..=COUNT).map(TestMsg::Note).collect();
    if received != expected {
        return Err(TestError::Assertion(format!(
            "messages out of order or duplicated: {received:?}"
        )));
    }
    Ok(())
}

/// A graceful client close reaches the server, which closes and
/// unregisters its session.
pub async fn run_graceful_goodbye<F: TransportFactory>() {
    if let Err(e) = run_graceful_goodbye_inner::<F>().await {
        panic!("run_graceful_goodbye failed: {e}");
    }
}

async fn run_graceful_goodbye_inner<F: TransportFactory>() -> Result<(), TestError> {
    init_tracing();
    let harness = Harness::connect::<F, _>("goodbye", |c| c).await?;

    if !harness.registry.contains("goodbye") {
        return Err(TestError::Assertion("server session not registered".into()));
    }
    if !harness.client.close() {
        return Err(TestError::Assertion("first close did not transition".into()));
    }
    if harness.client.close() {
        return Err(TestError::Assertion("second close transitioned again".into()));
    }

    let closed = harness.server.close_future();
    tokio::time::timeout(Duration::from_secs(2), closed.wait())
        .await
        .map_err(|_| TestError::Assertion("server session did not close".into()))?
        .map_err(|e| TestError::Setup(e.to_string()))?;

    if harness.registry.contains("goodbye") {
        return Err(TestError::Assertion("server session still registered".into()));
    }
    Ok(())
}
