//! The per-session handler chain.
//!
//! A [`Pipeline`] is an ordered list of named [`Handler`]s. Index 0 is the
//! head (transport side), the last index is the tail (application side).
//!
//! ```text
//!            inbound  ─────────────────────────────────────▶
//!  transport ◀─▶ [0 reliable] ◀─▶ [1 rpc] ◀─▶ [2 app...] ◀─▶ tail (dropped)
//!            ◀─────────────────────────────────────  outbound
//! ```
//!
//! Dispatch is an explicit iteration over a work queue, not recursion. A
//! handler at position `i` forwards inbound events to `i + 1` with
//! [`HandlerCtx::fire_read`] and outbound events to `i - 1` with
//! [`HandlerCtx::write`]. Not forwarding consumes the event. Outbound events
//! that leave the head become packets for the transport; inbound events that
//! leave the tail are logged and dropped.
//!
//! Each handler invocation is isolated: an `Err` or a panic is logged, the
//! event is dropped and the rest of the queue keeps running.

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use crate::error::{HandlerResult, PipelineError, RpcError};
use crate::executor::panic_message;
use crate::packet::{Envelope, Packet, Payload};
use crate::rpc::OutboundCall;
use crate::session::Session;

/// Everything that travels through the pipeline.
pub enum Event<M> {
    /// A raw packet: inbound from the transport, or outbound to it.
    Packet(Packet<M>),
    /// An RPC envelope.
    Envelope(Envelope<M>),
    /// An outbound RPC call that still needs a request id.
    Call(OutboundCall<M>),
    /// An outbound one-way application message.
    Message(M),
    /// Release whatever is buffered towards the transport now.
    Flush,
    /// The transport was re-attached after a resume.
    Reconnected,
}

impl<M> Event<M> {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Packet(_) => "packet",
            Event::Envelope(_) => "envelope",
            Event::Call(_) => "call",
            Event::Message(_) => "message",
            Event::Flush => "flush",
            Event::Reconnected => "reconnected",
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for Event<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Packet(p) => f.debug_tuple("Packet").field(p).finish(),
            Event::Envelope(e) => f.debug_tuple("Envelope").field(e).finish(),
            Event::Call(c) => f.debug_tuple("Call").field(&c.payload).finish(),
            Event::Message(m) => f.debug_tuple("Message").field(m).finish(),
            Event::Flush => f.write_str("Flush"),
            Event::Reconnected => f.write_str("Reconnected"),
        }
    }
}

/// A stage of the pipeline. Every method has a pass-through default.
pub trait Handler<M: Payload>: Send + 'static {
    /// The session became active.
    fn on_active(&mut self, ctx: &mut HandlerCtx<'_, M>) -> HandlerResult {
        let _ = ctx;
        Ok(())
    }

    /// The session closed. Runs once per session, after `close` for graceful
    /// closes of an active session.
    fn on_inactive(&mut self, ctx: &mut HandlerCtx<'_, M>) -> HandlerResult {
        let _ = ctx;
        Ok(())
    }

    fn read(&mut self, ctx: &mut HandlerCtx<'_, M>, event: Event<M>) -> HandlerResult {
        ctx.fire_read(event);
        Ok(())
    }

    fn write(&mut self, ctx: &mut HandlerCtx<'_, M>, event: Event<M>) -> HandlerResult {
        ctx.write(event);
        Ok(())
    }

    /// Graceful close is starting; the transport is still attached.
    fn close(&mut self, ctx: &mut HandlerCtx<'_, M>) -> HandlerResult {
        let _ = ctx;
        Ok(())
    }

    /// Session timer tick.
    fn tick(&mut self, ctx: &mut HandlerCtx<'_, M>) -> HandlerResult {
        let _ = ctx;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Hook {
    Active,
    Inactive,
    Close,
    Tick,
}

impl Hook {
    fn name(self) -> &'static str {
        match self {
            Hook::Active => "on_active",
            Hook::Inactive => "on_inactive",
            Hook::Close => "close",
            Hook::Tick => "tick",
        }
    }
}

enum Work<M> {
    Hook(usize, Hook),
    /// Inbound event for the handler at this index; `len` means the tail.
    Inbound(usize, Event<M>),
    /// Outbound event for the handler at this index; `None` means the head.
    Outbound(Option<usize>, Event<M>),
}

/// What a handler sees while it runs.
pub struct HandlerCtx<'a, M: Payload> {
    index: usize,
    name: &'a str,
    queue: &'a mut VecDeque<Work<M>>,
    session: &'a Session<M>,
    now: Instant,
}

impl<'a, M: Payload> HandlerCtx<'a, M> {
    /// Forward an inbound event to the next handler.
    pub fn fire_read(&mut self, event: Event<M>) {
        self.queue.push_back(Work::Inbound(self.index + 1, event));
    }

    /// Forward an outbound event to the previous handler.
    pub fn write(&mut self, event: Event<M>) {
        self.queue
            .push_back(Work::Outbound(self.index.checked_sub(1), event));
    }

    pub fn session(&self) -> &Session<M> {
        self.session
    }

    /// Name this handler was registered under.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Time the current dispatch round started.
    pub fn now(&self) -> Instant {
        self.now
    }
}

struct Entry<M> {
    name: String,
    handler: Box<dyn Handler<M>>,
}

/// Ordered, mutable chain of named handlers.
pub struct Pipeline<M> {
    entries: Vec<Entry<M>>,
}

impl<M> fmt::Debug for Pipeline<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| &e.name))
            .finish()
    }
}

impl<M: Payload> Default for Pipeline<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Payload> Pipeline<M> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handler names, head first.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    fn insert(
        &mut self,
        index: usize,
        name: impl Into<String>,
        handler: impl Handler<M>,
    ) -> Result<(), PipelineError> {
        let name = name.into();
        if self.contains(&name) {
            return Err(PipelineError::DuplicateName(name));
        }
        self.entries.insert(
            index,
            Entry {
                name,
                handler: Box::new(handler),
            },
        );
        Ok(())
    }

    pub fn add_first(
        &mut self,
        name: impl Into<String>,
        handler: impl Handler<M>,
    ) -> Result<(), PipelineError> {
        self.insert(0, name, handler)
    }

    pub fn add_last(
        &mut self,
        name: impl Into<String>,
        handler: impl Handler<M>,
    ) -> Result<(), PipelineError> {
        self.insert(self.entries.len(), name, handler)
    }

    pub fn add_before(
        &mut self,
        base: &str,
        name: impl Into<String>,
        handler: impl Handler<M>,
    ) -> Result<(), PipelineError> {
        let index = self
            .position(base)
            .ok_or_else(|| PipelineError::NotFound(base.to_string()))?;
        self.insert(index, name, handler)
    }

    pub fn add_after(
        &mut self,
        base: &str,
        name: impl Into<String>,
        handler: impl Handler<M>,
    ) -> Result<(), PipelineError> {
        let index = self
            .position(base)
            .ok_or_else(|| PipelineError::NotFound(base.to_string()))?;
        self.insert(index + 1, name, handler)
    }

    /// Remove a handler, returning it.
    pub fn remove(&mut self, name: &str) -> Result<Box<dyn Handler<M>>, PipelineError> {
        let index = self
            .position(name)
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))?;
        Ok(self.entries.remove(index).handler)
    }

    /// Swap the handler registered as `name` for a new one under `new_name`,
    /// returning the old handler.
    pub fn replace(
        &mut self,
        name: &str,
        new_name: impl Into<String>,
        handler: impl Handler<M>,
    ) -> Result<Box<dyn Handler<M>>, PipelineError> {
        let index = self
            .position(name)
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))?;
        let new_name = new_name.into();
        if new_name != name && self.contains(&new_name) {
            return Err(PipelineError::DuplicateName(new_name));
        }
        let old = std::mem::replace(
            &mut self.entries[index],
            Entry {
                name: new_name,
                handler: Box::new(handler),
            },
        );
        Ok(old.handler)
    }

    pub(crate) fn fire_active(&mut self, session: &Session<M>) -> Vec<Packet<M>> {
        self.run_hooks(session, Hook::Active, false)
    }

    pub(crate) fn fire_inactive(&mut self, session: &Session<M>) -> Vec<Packet<M>> {
        self.run_hooks(session, Hook::Inactive, false)
    }

    /// Close runs tail to head.
    pub(crate) fn fire_close(&mut self, session: &Session<M>) -> Vec<Packet<M>> {
        self.run_hooks(session, Hook::Close, true)
    }

    pub(crate) fn fire_tick(&mut self, session: &Session<M>) -> Vec<Packet<M>> {
        self.run_hooks(session, Hook::Tick, false)
    }

    /// Inject an inbound event at the head.
    pub(crate) fn fire_read(&mut self, session: &Session<M>, event: Event<M>) -> Vec<Packet<M>> {
        let mut queue = VecDeque::new();
        queue.push_back(Work::Inbound(0, event));
        self.drain(session, queue)
    }

    /// Inject an outbound event at the tail.
    pub(crate) fn fire_write(&mut self, session: &Session<M>, event: Event<M>) -> Vec<Packet<M>> {
        let mut queue = VecDeque::new();
        queue.push_back(Work::Outbound(self.entries.len().checked_sub(1), event));
        self.drain(session, queue)
    }

    fn run_hooks(&mut self, session: &Session<M>, hook: Hook, reverse: bool) -> Vec<Packet<M>> {
        let mut queue: VecDeque<Work<M>> = (0..self.entries.len())
            .map(|index| Work::Hook(index, hook))
            .collect();
        if reverse {
            queue.make_contiguous().reverse();
        }
        self.drain(session, queue)
    }

    fn drain(&mut self, session: &Session<M>, mut queue: VecDeque<Work<M>>) -> Vec<Packet<M>> {
        let now = Instant::now();
        let mut out = Vec::new();

        while let Some(work) = queue.pop_front() {
            let index = match work {
                Work::Outbound(None, event) => {
                    at_head(session, event, &mut out);
                    continue;
                }
                Work::Hook(i, _) | Work::Inbound(i, _) | Work::Outbound(Some(i), _) => i,
            };

            let Some(entry) = self.entries.get_mut(index) else {
                if let Work::Inbound(_, event) = work {
                    tracing::debug!(
                        session_id = %session.id(),
                        kind = event.kind(),
                        "inbound event reached pipeline tail; dropped"
                    );
                }
                continue;
            };

            let op = match &work {
                Work::Hook(_, hook) => hook.name(),
                Work::Inbound(..) => "read",
                Work::Outbound(..) => "write",
            };
            let mut ctx = HandlerCtx {
                index,
                name: &entry.name,
                queue: &mut queue,
                session,
                now,
            };
            let handler = &mut entry.handler;
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| match work {
                Work::Hook(_, Hook::Active) => handler.on_active(&mut ctx),
                Work::Hook(_, Hook::Inactive) => handler.on_inactive(&mut ctx),
                Work::Hook(_, Hook::Close) => handler.close(&mut ctx),
                Work::Hook(_, Hook::Tick) => handler.tick(&mut ctx),
                Work::Inbound(_, event) => handler.read(&mut ctx, event),
                Work::Outbound(_, event) => handler.write(&mut ctx, event),
            }));

            match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(
                        session_id = %session.id(),
                        handler = %entry.name,
                        op,
                        %error,
                        "handler failed; event dropped"
                    );
                }
                Err(panic) => {
                    tracing::error!(
                        session_id = %session.id(),
                        handler = %entry.name,
                        op,
                        message = %panic_message(panic.as_ref()),
                        "handler panicked; event dropped"
                    );
                }
            }
        }
        out
    }
}

fn at_head<M: Payload>(session: &Session<M>, event: Event<M>, out: &mut Vec<Packet<M>>) {
    match event {
        Event::Packet(packet) => out.push(packet),
        Event::Envelope(envelope) => out.push(Packet::Direct(envelope)),
        Event::Message(payload) => out.push(Packet::Direct(Envelope::OneWay(payload))),
        Event::Call(call) => {
            tracing::warn!(session_id = %session.id(), "rpc call reached the transport without an rpc handler");
            call.reply.resolve(Err(RpcError::Unroutable), session.config());
        }
        Event::Flush | Event::Reconnected => {}
    }
}
