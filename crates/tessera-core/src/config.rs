//! Session configuration.
//!
//! A [`SessionConfig`] is built once and shared (`Arc`) by every session
//! created from it. Timing and queue limits can be overridden from the
//! environment when the config is built:
//!
//! | variable                     | field                        |
//! |------------------------------|------------------------------|
//! | `TESSERA_SYNC_TIMEOUT_MS`    | synchronous RPC timeout      |
//! | `TESSERA_ASYNC_TIMEOUT_MS`   | asynchronous RPC timeout     |
//! | `TESSERA_SESSION_TIMEOUT_MS` | idle/session timeout         |
//! | `TESSERA_TICK_MS`            | session heartbeat tick       |
//! | `TESSERA_MAX_PENDING`        | reliable max pending         |
//! | `TESSERA_MAX_CACHE`          | reliable max cache size      |
//!
//! Unparseable or zero values are ignored.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::executor::Executor;
use crate::packet::Payload;
use crate::pipeline::Pipeline;
use crate::rpc::Dispatcher;

const DEFAULT_SYNC_RPC_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ASYNC_RPC_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_MAX_PENDING: usize = 64;
const DEFAULT_MAX_CACHE: usize = 4096;
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(3);

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
}

fn env_millis(name: &str) -> Option<Duration> {
    env_usize(name).map(|ms| Duration::from_millis(ms as u64))
}

/// Limits of the reliable-delivery sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableConfig {
    /// Most messages sent and not yet acknowledged.
    pub max_pending_messages: usize,
    /// Largest tolerated backlog of unsent messages. Exceeding it force-closes
    /// the session.
    pub max_cache_size: usize,
    /// How long a sent message may stay unacknowledged before the pending
    /// queue is retransmitted.
    pub ack_timeout: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_pending_messages: DEFAULT_MAX_PENDING,
            max_cache_size: DEFAULT_MAX_CACHE,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

/// Installs the application's own handlers into a fresh pipeline.
pub type PipelineInitializer<M> = Arc<dyn Fn(&mut Pipeline<M>) + Send + Sync>;

/// Immutable per-session configuration.
pub struct SessionConfig<M> {
    dispatcher: Arc<dyn Dispatcher<M>>,
    app_executor: Arc<dyn Executor>,
    session_timeout: Duration,
    sync_rpc_timeout: Duration,
    async_rpc_timeout: Duration,
    tick_interval: Duration,
    heartbeat_interval: Duration,
    handshake_timeout: Duration,
    resumable: bool,
    rpc: bool,
    reliable: Option<ReliableConfig>,
    initializer: Option<PipelineInitializer<M>>,
}

impl<M> fmt::Debug for SessionConfig<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("session_timeout", &self.session_timeout)
            .field("sync_rpc_timeout", &self.sync_rpc_timeout)
            .field("async_rpc_timeout", &self.async_rpc_timeout)
            .field("tick_interval", &self.tick_interval)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("resumable", &self.resumable)
            .field("rpc", &self.rpc)
            .field("reliable", &self.reliable)
            .finish_non_exhaustive()
    }
}

impl<M: Payload> SessionConfig<M> {
    pub fn builder(
        dispatcher: Arc<dyn Dispatcher<M>>,
        app_executor: Arc<dyn Executor>,
    ) -> SessionConfigBuilder<M> {
        SessionConfigBuilder {
            config: SessionConfig {
                dispatcher,
                app_executor,
                session_timeout: DEFAULT_SESSION_TIMEOUT,
                sync_rpc_timeout: DEFAULT_SYNC_RPC_TIMEOUT,
                async_rpc_timeout: DEFAULT_ASYNC_RPC_TIMEOUT,
                tick_interval: DEFAULT_TICK_INTERVAL,
                heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
                handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
                resumable: false,
                rpc: true,
                reliable: None,
                initializer: None,
            },
        }
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher<M>> {
        &self.dispatcher
    }

    pub fn app_executor(&self) -> &Arc<dyn Executor> {
        &self.app_executor
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn sync_rpc_timeout(&self) -> Duration {
        self.sync_rpc_timeout
    }

    pub fn async_rpc_timeout(&self) -> Duration {
        self.async_rpc_timeout
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn resumable(&self) -> bool {
        self.resumable
    }

    pub fn rpc_enabled(&self) -> bool {
        self.rpc
    }

    pub fn reliable(&self) -> Option<&ReliableConfig> {
        self.reliable.as_ref()
    }

    pub(crate) fn initializer(&self) -> Option<&PipelineInitializer<M>> {
        self.initializer.as_ref()
    }
}

/// Builder for [`SessionConfig`].
pub struct SessionConfigBuilder<M> {
    config: SessionConfig<M>,
}

impl<M: Payload> SessionConfigBuilder<M> {
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    pub fn sync_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync_rpc_timeout = timeout;
        self
    }

    pub fn async_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.async_rpc_timeout = timeout;
        self
    }

    /// Period of the session timer that drives `tick()`, the RPC timeout
    /// sweep and the idle check.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Keep the session open across transport loss, waiting for a resume.
    pub fn resumable(mut self, resumable: bool) -> Self {
        self.config.resumable = resumable;
        self
    }

    /// Install the RPC correlation handler (on by default).
    pub fn rpc(mut self, enabled: bool) -> Self {
        self.config.rpc = enabled;
        self
    }

    /// Install the reliable-delivery handler with these limits.
    pub fn reliable(mut self, reliable: ReliableConfig) -> Self {
        self.config.reliable = Some(reliable);
        self
    }

    pub fn pipeline_initializer<F>(mut self, init: F) -> Self
    where
        F: Fn(&mut Pipeline<M>) + Send + Sync + 'static,
    {
        self.config.initializer = Some(Arc::new(init));
        self
    }

    /// Apply environment overrides and freeze the configuration.
    pub fn build(mut self) -> Arc<SessionConfig<M>> {
        let c = &mut self.config;
        if let Some(d) = env_millis("TESSERA_SYNC_TIMEOUT_MS") {
            c.sync_rpc_timeout = d;
        }
        if let Some(d) = env_millis("TESSERA_ASYNC_TIMEOUT_MS") {
            c.async_rpc_timeout = d;
        }
        if let Some(d) = env_millis("TESSERA_SESSION_TIMEOUT_MS") {
            c.session_timeout = d;
        }
        if let Some(d) = env_millis("TESSERA_TICK_MS") {
            c.tick_interval = d;
        }
        if let Some(reliable) = c.reliable.as_mut() {
            if let Some(n) = env_usize("TESSERA_MAX_PENDING") {
                reliable.max_pending_messages = n;
            }
            if let Some(n) = env_usize("TESSERA_MAX_CACHE") {
                reliable.max_cache_size = n;
            }
        }
        if c.tick_interval.is_zero() {
            c.tick_interval = DEFAULT_TICK_INTERVAL;
        }
        Arc::new(self.config)
    }
}
