//! RPC correlation: request ids, pending calls, timeouts, response routing.
//!
//! [`RpcHandler`] sits above the reliable handler. Outbound, it turns an
//! [`Event::Call`] into a numbered [`Envelope::Request`] and remembers the
//! reply target. Inbound, it hands requests and one-way messages to the
//! application [`Dispatcher`] on the application executor and routes
//! responses back to the caller.
//!
//! Every pending call resolves exactly once: by its response, by the timeout
//! sweep that runs on each session tick, or by session close.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use crate::config::SessionConfig;
use crate::error::{FaultCode, HandlerResult, RemoteFault, RpcError, RpcResult};
use crate::future::Promise;
use crate::packet::{Envelope, Payload, RequestId};
use crate::pipeline::{Event, Handler, HandlerCtx};
use crate::session::Session;

/// Completion callback for an asynchronous call.
pub type RpcCallback<M> = Box<dyn FnOnce(RpcResult<M>) + Send + 'static>;

/// Application entry points. The core calls these on the application
/// executor, never on a session worker.
pub trait Dispatcher<M: Payload>: Send + Sync + 'static {
    /// Handle an inbound request. Answer through `channel`, now or later.
    fn post_rpc_request(&self, session: &Session<M>, payload: M, channel: ResponseChannel<M>);

    /// Handle an inbound one-way message.
    fn post_one_way_message(&self, session: &Session<M>, payload: M);

    /// Deliver the result of an asynchronous call to its callback.
    fn post_rpc_response(&self, callback: RpcCallback<M>, result: RpcResult<M>) {
        callback(result);
    }
}

/// Where an RPC result goes.
pub enum Reply<M> {
    /// Completed inline on the resolving thread.
    Promise(Promise<RpcResult<M>>),
    /// Delivered through [`Dispatcher::post_rpc_response`] on the application
    /// executor.
    Callback(RpcCallback<M>),
}

impl<M: Payload> Reply<M> {
    pub(crate) fn resolve(self, result: RpcResult<M>, config: &SessionConfig<M>) {
        match self {
            Reply::Promise(promise) => {
                promise.try_success(result);
            }
            Reply::Callback(callback) => {
                let dispatcher = Arc::clone(config.dispatcher());
                config
                    .app_executor()
                    .execute(Box::new(move || dispatcher.post_rpc_response(callback, result)));
            }
        }
    }
}

/// An outbound call before it has a request id.
pub struct OutboundCall<M> {
    pub payload: M,
    /// Synchronous calls use the synchronous timeout and flush at once.
    pub sync: bool,
    pub reply: Reply<M>,
}

struct PendingCall<M> {
    deadline: Instant,
    sync: bool,
    reply: Reply<M>,
}

/// Pending-call bookkeeping.
///
/// Calls are keyed by id and indexed by a deadline-ordered min-heap, so the
/// sweep expires calls in deadline order even when synchronous and
/// asynchronous timeouts differ. Heap entries of calls that already resolved
/// are skipped lazily.
struct PendingCalls<M> {
    next_id: RequestId,
    calls: HashMap<RequestId, PendingCall<M>>,
    deadlines: BinaryHeap<Reverse<(Instant, RequestId)>>,
}

impl<M> PendingCalls<M> {
    fn new() -> Self {
        Self {
            next_id: 1,
            calls: HashMap::new(),
            deadlines: BinaryHeap::new(),
        }
    }

    fn insert(&mut self, deadline: Instant, sync: bool, reply: Reply<M>) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        self.calls.insert(
            id,
            PendingCall {
                deadline,
                sync,
                reply,
            },
        );
        self.deadlines.push(Reverse((deadline, id)));
        id
    }

    fn remove(&mut self, id: RequestId) -> Option<PendingCall<M>> {
        self.calls.remove(&id)
    }

    /// Remove every call whose deadline is at or before `now`, earliest
    /// deadline first.
    fn expire(&mut self, now: Instant) -> Vec<(RequestId, PendingCall<M>)> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if let Some(call) = self.calls.remove(&id) {
                expired.push((id, call));
            }
        }
        expired
    }

    /// Remove every call, in id order.
    fn drain(&mut self) -> Vec<(RequestId, PendingCall<M>)> {
        self.deadlines.clear();
        let mut all: Vec<_> = self.calls.drain().collect();
        all.sort_unstable_by_key(|(id, _)| *id);
        all
    }

    fn len(&self) -> usize {
        self.calls.len()
    }
}

/// Pipeline handler that correlates requests and responses.
pub struct RpcHandler<M> {
    pending: PendingCalls<M>,
}

impl<M: Payload> Default for RpcHandler<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Payload> RpcHandler<M> {
    pub fn new() -> Self {
        Self {
            pending: PendingCalls::new(),
        }
    }

    /// Calls still waiting for a result.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    fn dispatch_request(session: &Session<M>, id: RequestId, sync: bool, payload: M) {
        let config = session.config();
        let dispatcher = Arc::clone(config.dispatcher());
        let channel = ResponseChannel::new(session.clone(), id, sync);
        let session = session.clone();
        config.app_executor().execute(Box::new(move || {
            // A panic here drops `channel`, which answers with an internal fault.
            dispatcher.post_rpc_request(&session, payload, channel);
        }));
    }

    fn dispatch_one_way(session: &Session<M>, payload: M) {
        let config = session.config();
        let dispatcher = Arc::clone(config.dispatcher());
        let session = session.clone();
        config.app_executor().execute(Box::new(move || {
            dispatcher.post_one_way_message(&session, payload);
        }));
    }
}

impl<M: Payload> Handler<M> for RpcHandler<M> {
    fn read(&mut self, ctx: &mut HandlerCtx<'_, M>, event: Event<M>) -> HandlerResult {
        let envelope = match event {
            Event::Envelope(envelope) => envelope,
            other => {
                ctx.fire_read(other);
                return Ok(());
            }
        };

        let session = ctx.session();
        match envelope {
            Envelope::Request { id, sync, payload } => {
                tracing::trace!(session_id = %session.id(), request_id = id, sync, "rpc request received");
                Self::dispatch_request(session, id, sync, payload);
            }
            Envelope::OneWay(payload) => {
                Self::dispatch_one_way(session, payload);
            }
            Envelope::Response { id, body } => match self.pending.remove(id) {
                Some(call) => {
                    let result = if session.is_active() {
                        body.map_err(RpcError::Remote)
                    } else {
                        Err(RpcError::SessionClosed)
                    };
                    tracing::trace!(
                        session_id = %session.id(),
                        request_id = id,
                        sync = call.sync,
                        ok = result.is_ok(),
                        "rpc response routed"
                    );
                    call.reply.resolve(result, session.config());
                }
                None => {
                    tracing::debug!(
                        session_id = %session.id(),
                        request_id = id,
                        "response for unknown or expired request; discarded"
                    );
                }
            },
        }
        Ok(())
    }

    fn write(&mut self, ctx: &mut HandlerCtx<'_, M>, event: Event<M>) -> HandlerResult {
        match event {
            Event::Call(call) => {
                let config = ctx.session().config();
                let timeout = if call.sync {
                    config.sync_rpc_timeout()
                } else {
                    config.async_rpc_timeout()
                };
                let id = self
                    .pending
                    .insert(ctx.now() + timeout, call.sync, call.reply);
                tracing::trace!(
                    session_id = %ctx.session().id(),
                    request_id = id,
                    sync = call.sync,
                    "rpc request issued"
                );
                ctx.write(Event::Envelope(Envelope::Request {
                    id,
                    sync: call.sync,
                    payload: call.payload,
                }));
                if call.sync {
                    ctx.write(Event::Flush);
                }
            }
            Event::Message(payload) => ctx.write(Event::Envelope(Envelope::OneWay(payload))),
            other => ctx.write(other),
        }
        Ok(())
    }

    fn tick(&mut self, ctx: &mut HandlerCtx<'_, M>) -> HandlerResult {
        let expired = self.pending.expire(ctx.now());
        let session = ctx.session();
        for (id, call) in expired {
            tracing::debug!(
                session_id = %session.id(),
                request_id = id,
                sync = call.sync,
                overdue = ?ctx.now().saturating_duration_since(call.deadline),
                "rpc call timed out"
            );
            call.reply.resolve(Err(RpcError::Timeout), session.config());
        }
        Ok(())
    }

    fn on_inactive(&mut self, ctx: &mut HandlerCtx<'_, M>) -> HandlerResult {
        let session = ctx.session();
        let config = session.config();
        let mut callbacks = Vec::new();

        for (_, call) in self.pending.drain() {
            match call.reply {
                Reply::Promise(promise) => {
                    promise.try_success(Err(RpcError::SessionClosed));
                }
                Reply::Callback(callback) => callbacks.push(callback),
            }
        }

        if !callbacks.is_empty() {
            tracing::debug!(
                session_id = %session.id(),
                count = callbacks.len(),
                "resolving asynchronous calls after close"
            );
            let dispatcher = Arc::clone(config.dispatcher());
            config.app_executor().execute(Box::new(move || {
                for callback in callbacks {
                    dispatcher.post_rpc_response(callback, Err(RpcError::SessionClosed));
                }
            }));
        }
        Ok(())
    }
}

/// One-shot answer to an inbound request.
///
/// Dropping the channel without answering sends an
/// [`FaultCode::Internal`] fault.
pub struct ResponseChannel<M: Payload> {
    session: Session<M>,
    id: RequestId,
    sync: bool,
    answered: bool,
}

impl<M: Payload> std::fmt::Debug for ResponseChannel<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseChannel")
            .field("session_id", &self.session.id())
            .field("id", &self.id)
            .field("sync", &self.sync)
            .finish()
    }
}

impl<M: Payload> ResponseChannel<M> {
    pub(crate) fn new(session: Session<M>, id: RequestId, sync: bool) -> Self {
        Self {
            session,
            id,
            sync,
            answered: false,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// True when the caller is blocked on this answer; the response is
    /// flushed immediately.
    pub fn is_sync(&self) -> bool {
        self.sync
    }

    pub fn session(&self) -> &Session<M> {
        &self.session
    }

    pub fn write(mut self, response: M) {
        self.answer(Ok(response));
    }

    pub fn fail(mut self, fault: RemoteFault) {
        self.answer(Err(fault));
    }

    fn answer(&mut self, body: Result<M, RemoteFault>) {
        self.answered = true;
        self.session
            .write_response(Envelope::Response { id: self.id, body }, self.sync);
    }
}

impl<M: Payload> Drop for ResponseChannel<M> {
    fn drop(&mut self) {
        if !self.answered {
            tracing::warn!(
                session_id = %self.session.id(),
                request_id = self.id,
                "request dropped without a response"
            );
            self.answer(Err(RemoteFault::new(
                FaultCode::Internal,
                "request dropped without a response",
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn promise_reply() -> (Reply<u32>, Promise<RpcResult<u32>>) {
        let promise = Promise::new();
        (Reply::Promise(promise.clone()), promise)
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let mut pending = PendingCalls::new();
        let now = Instant::now();
        let a = pending.insert(now, true, promise_reply().0);
        let b = pending.insert(now, false, promise_reply().0);
        assert_eq!((a, b), (1, 2));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn expiry_follows_deadlines_not_ids() {
        let mut pending = PendingCalls::new();
        let now = Instant::now();
        let long = pending.insert(now + Duration::from_secs(30), false, promise_reply().0);
        let short = pending.insert(now + Duration::from_millis(100), true, promise_reply().0);

        assert!(pending.expire(now).is_empty());
        let first: Vec<_> = pending
            .expire(now + Duration::from_millis(100))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(first, vec![short]);

        let second: Vec<_> = pending
            .expire(now + Duration::from_secs(31))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(second, vec![long]);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn removed_calls_are_skipped_by_the_sweep() {
        let mut pending = PendingCalls::new();
        let now = Instant::now();
        let id = pending.insert(now, true, promise_reply().0);
        assert!(pending.remove(id).is_some());
        assert!(pending.expire(now + Duration::from_secs(1)).is_empty());
        assert!(pending.remove(id).is_none());
    }

    #[test]
    fn drain_is_in_id_order() {
        let mut pending = PendingCalls::new();
        let now = Instant::now();
        for offset in [5u64, 1, 3] {
            pending.insert(now + Duration::from_secs(offset), false, promise_reply().0);
        }
        let ids: Vec<_> = pending.drain().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
