//! Sequence/ack based reliable delivery.
//!
//! Every outbound envelope gets the next sequence number and waits in the
//! *cache*. It moves to *pending* (sent, unacknowledged) when released:
//!
//! - on an explicit [`Event::Flush`] (synchronous RPC traffic),
//! - automatically once the cache holds at least half of
//!   `max_pending_messages` while pending is at most half full,
//! - after an ack frees room in pending,
//! - on every tick, so a partial batch waits at most one tick interval,
//! - when the session closes gracefully.
//!
//! Before activation nothing is released; the cache drains on activation.
//!
//! Pending never holds more than `max_pending_messages` entries. Each
//! [`Packet::Batch`] carries the sender's cumulative ack, the highest
//! contiguous inbound sequence delivered. Inbound, only the next expected
//! sequence is delivered; duplicates and gaps are dropped and left to
//! retransmission.
//!
//! ```text
//!   enqueue ─▶ cache ──release──▶ pending ──ack──▶ (gone)
//!                                   │
//!                    resume / ack timeout: resend all
//! ```
//!
//! Ping and pong bypass both queues and always carry the ack.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::ReliableConfig;
use crate::error::HandlerResult;
use crate::packet::{Envelope, Packet, Payload, Seq, Sequenced};
use crate::pipeline::{Event, Handler, HandlerCtx};
use crate::session::SessionState;

struct InFlight<M> {
    message: Sequenced<M>,
    deadline: Instant,
}

/// Reliable-delivery state of one session.
pub struct MessageQueue<M> {
    next_sequence: Seq,
    received: Seq,
    cache: VecDeque<Sequenced<M>>,
    pending: VecDeque<InFlight<M>>,
    max_pending: usize,
    max_cache: usize,
    ack_timeout: Duration,
}

impl<M: Payload> MessageQueue<M> {
    pub fn new(config: &ReliableConfig) -> Self {
        Self {
            next_sequence: 1,
            received: 0,
            cache: VecDeque::new(),
            pending: VecDeque::new(),
            max_pending: config.max_pending_messages.max(1),
            max_cache: config.max_cache_size,
            ack_timeout: config.ack_timeout,
        }
    }

    /// Sequence number the next enqueued envelope will get.
    pub fn next_sequence(&self) -> Seq {
        self.next_sequence
    }

    /// Highest contiguous inbound sequence delivered; the ack we send.
    pub fn received(&self) -> Seq {
        self.received
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_sequences(&self) -> Vec<Seq> {
        self.pending.iter().map(|p| p.message.seq).collect()
    }

    /// Assign the next sequence number and append to the cache.
    pub fn enqueue(&mut self, envelope: Envelope<M>) -> Seq {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        self.cache.push_back(Sequenced { seq, envelope });
        seq
    }

    pub fn is_overflowing(&self) -> bool {
        self.cache.len() > self.max_cache
    }

    /// Whether the automatic release threshold is reached.
    pub fn should_release(&self) -> bool {
        let half = self.max_pending / 2;
        self.cache.len() >= half.max(1) && self.pending.len() <= half
    }

    pub fn has_room(&self) -> bool {
        self.pending.len() < self.max_pending
    }

    /// Move messages from cache to pending while pending has room; returns
    /// the messages to transmit.
    pub fn release(&mut self, now: Instant) -> Vec<Sequenced<M>> {
        let mut batch = Vec::new();
        while self.pending.len() < self.max_pending {
            let Some(message) = self.cache.pop_front() else {
                break;
            };
            batch.push(message.clone());
            self.pending.push_back(InFlight {
                message,
                deadline: now + self.ack_timeout,
            });
        }
        batch
    }

    /// Drop every pending entry with sequence <= `ack`. Returns how many
    /// were removed.
    pub fn acknowledge(&mut self, ack: Seq) -> usize {
        let before = self.pending.len();
        while self.pending.front().is_some_and(|p| p.message.seq <= ack) {
            self.pending.pop_front();
        }
        before - self.pending.len()
    }

    /// Accept an inbound sequence if it is the next expected one.
    pub fn accept(&mut self, seq: Seq) -> bool {
        if seq == self.received + 1 {
            self.received = seq;
            true
        } else {
            false
        }
    }

    /// Every pending message, in order, with refreshed deadlines.
    pub fn retransmit(&mut self, now: Instant) -> Vec<Sequenced<M>> {
        let deadline = now + self.ack_timeout;
        self.pending
            .iter_mut()
            .map(|p| {
                p.deadline = deadline;
                p.message.clone()
            })
            .collect()
    }

    /// True if the oldest pending message waited past its deadline.
    pub fn ack_overdue(&self, now: Instant) -> bool {
        self.pending.front().is_some_and(|p| p.deadline <= now)
    }
}

/// Pipeline handler running the reliable-delivery sub-protocol.
pub struct ReliableHandler<M> {
    queue: MessageQueue<M>,
    heartbeat_interval: Duration,
    last_ping: Option<Instant>,
    sent_ack: Seq,
}

impl<M: Payload> ReliableHandler<M> {
    pub fn new(config: &ReliableConfig, heartbeat_interval: Duration) -> Self {
        Self {
            queue: MessageQueue::new(config),
            heartbeat_interval,
            last_ping: None,
            sent_ack: 0,
        }
    }

    pub fn queue(&self) -> &MessageQueue<M> {
        &self.queue
    }

    fn transmit(&mut self, ctx: &mut HandlerCtx<'_, M>, messages: Vec<Sequenced<M>>) {
        if messages.is_empty() {
            return;
        }
        let ack = self.queue.received();
        self.sent_ack = ack;
        tracing::trace!(
            session_id = %ctx.session().id(),
            first = messages[0].seq,
            count = messages.len(),
            ack,
            "sending batch"
        );
        ctx.write(Event::Packet(Packet::Batch { ack, messages }));
    }

    fn release(&mut self, ctx: &mut HandlerCtx<'_, M>) {
        // Nothing leaves the cache before activation; `on_active` releases it.
        if ctx.session().state() == SessionState::Bound {
            return;
        }
        let batch = self.queue.release(ctx.now());
        self.transmit(ctx, batch);
    }

    fn on_ack(&mut self, ctx: &mut HandlerCtx<'_, M>, ack: Seq) {
        if self.queue.acknowledge(ack) > 0 {
            self.release(ctx);
        }
    }

    fn enqueue(&mut self, ctx: &mut HandlerCtx<'_, M>, envelope: Envelope<M>) {
        let seq = self.queue.enqueue(envelope);
        if self.queue.is_overflowing() {
            tracing::warn!(
                session_id = %ctx.session().id(),
                seq,
                cache = self.queue.cache_len(),
                "reliable cache overflow; closing session"
            );
            ctx.session().close_forcibly();
            return;
        }
        if self.queue.should_release() {
            self.release(ctx);
        }
    }

    fn send_control(&mut self, ctx: &mut HandlerCtx<'_, M>, ping: bool) {
        let ack = self.queue.received();
        self.sent_ack = ack;
        let packet = if ping {
            Packet::Ping { ack }
        } else {
            Packet::Pong { ack }
        };
        ctx.write(Event::Packet(packet));
    }
}

impl<M: Payload> Handler<M> for ReliableHandler<M> {
    fn on_active(&mut self, ctx: &mut HandlerCtx<'_, M>) -> HandlerResult {
        self.last_ping = Some(ctx.now());
        self.release(ctx);
        Ok(())
    }

    fn read(&mut self, ctx: &mut HandlerCtx<'_, M>, event: Event<M>) -> HandlerResult {
        match event {
            Event::Packet(Packet::Batch { ack, messages }) => {
                self.on_ack(ctx, ack);
                for message in messages {
                    if self.queue.accept(message.seq) {
                        ctx.fire_read(Event::Envelope(message.envelope));
                    } else {
                        tracing::trace!(
                            session_id = %ctx.session().id(),
                            seq = message.seq,
                            expected = self.queue.received() + 1,
                            "out-of-order or duplicate message dropped"
                        );
                    }
                }
            }
            Event::Packet(Packet::Ping { ack }) => {
                self.on_ack(ctx, ack);
                self.send_control(ctx, false);
            }
            Event::Packet(Packet::Pong { ack }) => self.on_ack(ctx, ack),
            Event::Reconnected => {
                let resend = self.queue.retransmit(ctx.now());
                tracing::debug!(
                    session_id = %ctx.session().id(),
                    count = resend.len(),
                    "link resumed; retransmitting pending"
                );
                self.transmit(ctx, resend);
                self.release(ctx);
                ctx.fire_read(Event::Reconnected);
            }
            other => ctx.fire_read(other),
        }
        Ok(())
    }

    fn write(&mut self, ctx: &mut HandlerCtx<'_, M>, event: Event<M>) -> HandlerResult {
        match event {
            Event::Envelope(envelope) => self.enqueue(ctx, envelope),
            Event::Message(payload) => self.enqueue(ctx, Envelope::OneWay(payload)),
            Event::Flush => self.release(ctx),
            other => ctx.write(other),
        }
        Ok(())
    }

    fn close(&mut self, ctx: &mut HandlerCtx<'_, M>) -> HandlerResult {
        self.release(ctx);
        Ok(())
    }

    fn tick(&mut self, ctx: &mut HandlerCtx<'_, M>) -> HandlerResult {
        if !ctx.session().is_active() {
            return Ok(());
        }
        let now = ctx.now();

        // Below the auto-release threshold the cache drains once per tick.
        if self.queue.cache_len() > 0 && self.queue.has_room() {
            self.release(ctx);
        }

        if self.queue.ack_overdue(now) {
            let resend = self.queue.retransmit(now);
            tracing::debug!(
                session_id = %ctx.session().id(),
                count = resend.len(),
                "ack timeout; retransmitting pending"
            );
            self.transmit(ctx, resend);
        }

        let ping_due = !self.heartbeat_interval.is_zero()
            && self
                .last_ping
                .is_none_or(|last| now.saturating_duration_since(last) >= self.heartbeat_interval);
        if ping_due {
            self.last_ping = Some(now);
            self.send_control(ctx, true);
        } else if self.queue.received() > self.sent_ack {
            // Standalone ack for one-directional traffic.
            self.send_control(ctx, false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max_pending: usize) -> MessageQueue<u32> {
        MessageQueue::new(&ReliableConfig {
            max_pending_messages: max_pending,
            max_cache_size: 8,
            ack_timeout: Duration::from_secs(1),
        })
    }

    #[test]
    fn sequences_start_at_one() {
        let mut q = queue(4);
        assert_eq!(q.enqueue(Envelope::OneWay(10)), 1);
        assert_eq!(q.enqueue(Envelope::OneWay(11)), 2);
        assert_eq!(q.next_sequence(), 3);
    }

    #[test]
    fn release_respects_max_pending() {
        let mut q = queue(2);
        let now = Instant::now();
        for i in 0..5 {
            q.enqueue(Envelope::OneWay(i));
        }
        let batch = q.release(now);
        assert_eq!(batch.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(q.cache_len(), 3);
        assert!(q.release(now).is_empty());

        assert_eq!(q.acknowledge(1), 1);
        assert_eq!(q.release(now).iter().map(|m| m.seq).collect::<Vec<_>>(), vec![3]);
        assert_eq!(q.pending_sequences(), vec![2, 3]);
    }

    #[test]
    fn auto_release_threshold() {
        let mut q = queue(4);
        q.enqueue(Envelope::OneWay(0));
        assert!(!q.should_release());
        q.enqueue(Envelope::OneWay(1));
        assert!(q.should_release());
        q.release(Instant::now());
        q.enqueue(Envelope::OneWay(2));
        q.enqueue(Envelope::OneWay(3));
        // Pending holds 2 of 4: still at most half full.
        assert!(q.should_release());
        q.release(Instant::now());
        q.enqueue(Envelope::OneWay(4));
        q.enqueue(Envelope::OneWay(5));
        assert!(!q.should_release());
    }

    #[test]
    fn stale_ack_removes_nothing() {
        let mut q = queue(4);
        for i in 0..3 {
            q.enqueue(Envelope::OneWay(i));
        }
        q.release(Instant::now());
        assert_eq!(q.acknowledge(2), 2);
        assert_eq!(q.acknowledge(1), 0);
        assert_eq!(q.pending_sequences(), vec![3]);
    }

    #[test]
    fn only_next_expected_sequence_is_accepted() {
        let mut q = queue(4);
        assert!(!q.accept(2));
        assert!(q.accept(1));
        assert!(!q.accept(1));
        assert!(q.accept(2));
        assert_eq!(q.received(), 2);
    }

    #[test]
    fn retransmit_refreshes_deadlines_and_keeps_cache() {
        let mut q = queue(2);
        let start = Instant::now();
        for i in 0..3 {
            q.enqueue(Envelope::OneWay(i));
        }
        q.release(start);
        assert!(q.ack_overdue(start + Duration::from_secs(1)));

        let later = start + Duration::from_secs(2);
        let resent = q.retransmit(later);
        assert_eq!(resent.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert!(!q.ack_overdue(later));
        assert_eq!(q.cache_len(), 1);
    }

    #[test]
    fn overflow_is_strictly_above_max_cache() {
        let mut q = queue(1);
        for i in 0..8 {
            q.enqueue(Envelope::OneWay(i));
        }
        assert!(!q.is_overflowing());
        q.enqueue(Envelope::OneWay(8));
        assert!(q.is_overflowing());
    }
}
