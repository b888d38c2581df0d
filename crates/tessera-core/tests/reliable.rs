use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use tessera_core::transport::mem::MemTransport;
use tessera_core::{
    Acceptor, Envelope, MessageQueue, Packet, ReliableConfig, Seq, Sequenced, Session,
    SessionRegistry, WorkerGroup,
};
use tessera_testkit::{RawPeer, RecordingDispatcher, TestMsg, app_executor, init_tracing, test_config};

type Peer = RawPeer<MemTransport<TestMsg>>;

struct Server {
    _workers: Arc<WorkerGroup>,
    registry: SessionRegistry<TestMsg>,
    acceptor: Acceptor<TestMsg>,
}

fn server(reliable: ReliableConfig, resumable: bool) -> Server {
    let workers = Arc::new(WorkerGroup::new(1).expect("workers"));
    let registry = SessionRegistry::new();
    let config = test_config(
        RecordingDispatcher::new(),
        app_executor().expect("app executor"),
    )
    .reliable(reliable)
    .resumable(resumable)
    .build();
    let acceptor = Acceptor::new(workers.clone(), registry.clone(), config);
    Server {
        _workers: workers,
        registry,
        acceptor,
    }
}

/// Handshake a raw peer into `server` as `id`.
async fn join(server: &Server, id: &str, expect_resumed: bool) -> (Session<TestMsg>, Peer) {
    let (local, remote) = MemTransport::pair();
    let peer = RawPeer::new(local);
    peer.send(Packet::Handshake {
        session_id: id.to_string(),
    })
    .await
    .expect("send handshake");
    let session = server.acceptor.accept(remote).await.expect("accepted");
    match peer.recv(Duration::from_secs(1)).await.expect("ack") {
        Packet::HandshakeAck { resumed } => assert_eq!(resumed, expect_resumed),
        other => panic!("expected handshake ack, got {other:?}"),
    }
    (session, peer)
}

/// Collect `count` sequence numbers from batches.
async fn collect_seqs(peer: &Peer, count: usize) -> Vec<Seq> {
    let mut seqs = Vec::new();
    while seqs.len() < count {
        match peer.recv_data(Duration::from_secs(1)).await.expect("batch") {
            Packet::Batch { messages, .. } => seqs.extend(messages.iter().map(|m| m.seq)),
            other => panic!("expected batch, got {other:?}"),
        }
    }
    seqs
}

#[tokio::test]
async fn in_flight_window_is_bounded_by_max_pending() {
    init_tracing();
    let server = server(
        ReliableConfig {
            max_pending_messages: 2,
            ..Default::default()
        },
        false,
    );
    let (session, peer) = join(&server, "window", false).await;

    for n in 1..=5 {
        session.send(TestMsg::Note(n)).expect("send");
    }
    session.flush().expect("flush");

    assert_eq!(collect_seqs(&peer, 2).await, vec![1, 2]);
    peer.expect_quiet(Duration::from_millis(100))
        .await
        .expect("window full");

    peer.send(Packet::Pong { ack: 2 }).await.expect("ack");
    assert_eq!(collect_seqs(&peer, 2).await, vec![3, 4]);

    peer.send(Packet::Pong { ack: 4 }).await.expect("ack");
    assert_eq!(collect_seqs(&peer, 1).await, vec![5]);
    session.close();
}

#[tokio::test]
async fn inbound_batches_are_delivered_once_in_order() {
    init_tracing();
    let server = server(ReliableConfig::default(), false);
    let (session, peer) = join(&server, "inbound", false).await;

    let note = |seq: Seq| Sequenced {
        seq,
        envelope: Envelope::OneWay(TestMsg::Note(seq)),
    };
    // Out of order, then duplicated, then the gap filled.
    for batch in [vec![note(2)], vec![note(1)], vec![note(1), note(2)], vec![note(2), note(3)]] {
        peer.send(Packet::Batch {
            ack: 0,
            messages: batch,
        })
        .await
        .expect("send");
    }

    // The standalone ack reports the highest in-order sequence.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    let mut acked = 0;
    while acked < 3 {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        if let Packet::Pong { ack } = peer.recv(left).await.expect("ack") {
            assert!(ack >= acked, "ack went backwards");
            acked = ack;
        }
    }
    session.close();
}

#[tokio::test]
async fn resumed_session_retransmits_unacknowledged() {
    init_tracing();
    let server = server(ReliableConfig::default(), true);
    let (session, peer) = join(&server, "resume", false).await;

    for n in 1..=3 {
        session.send(TestMsg::Note(n)).expect("send");
    }
    session.flush().expect("flush");
    assert_eq!(collect_seqs(&peer, 3).await, vec![1, 2, 3]);

    // Acknowledge the first, then lose the link.
    peer.send(Packet::Pong { ack: 1 }).await.expect("ack");
    tokio::time::sleep(Duration::from_millis(30)).await;
    peer.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.is_active(), "resumable session survives link loss");

    let (resumed, peer) = join(&server, "resume", true).await;
    assert_eq!(resumed.id(), session.id());
    assert_eq!(server.registry.len(), 1);
    assert_eq!(collect_seqs(&peer, 2).await, vec![2, 3]);

    session.send(TestMsg::Note(4)).expect("send");
    session.flush().expect("flush");
    assert_eq!(collect_seqs(&peer, 1).await, vec![4]);
    session.close();
}

#[tokio::test]
async fn link_loss_closes_non_resumable_session() {
    init_tracing();
    let server = server(ReliableConfig::default(), false);
    let (session, peer) = join(&server, "fragile", false).await;
    peer.close();
    tokio::time::timeout(Duration::from_secs(1), session.close_future().wait())
        .await
        .expect("closed after link loss")
        .expect("closed");
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn cache_overflow_closes_session() {
    init_tracing();
    let server = server(
        ReliableConfig {
            max_pending_messages: 1,
            max_cache_size: 4,
            ..Default::default()
        },
        false,
    );
    let (session, _peer) = join(&server, "overflow", false).await;
    for n in 0..8 {
        let _ = session.send(TestMsg::Note(n));
    }
    tokio::time::timeout(Duration::from_secs(1), session.close_future().wait())
        .await
        .expect("overflow closes the session")
        .expect("closed");
}

#[tokio::test]
async fn partial_batches_go_out_on_the_next_tick() {
    init_tracing();
    let server = server(
        ReliableConfig {
            max_pending_messages: 8,
            ..Default::default()
        },
        false,
    );
    let (session, peer) = join(&server, "trickle", false).await;

    // One message stays below the release threshold; no flush follows.
    session.send(TestMsg::Note(1)).expect("send");
    assert_eq!(collect_seqs(&peer, 1).await, vec![1]);

    session.call_async(TestMsg::Echo("late".into()), |_| {});
    match peer.recv_data(Duration::from_secs(1)).await.expect("batch") {
        Packet::Batch { messages, .. } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].seq, 2);
            assert!(matches!(
                &messages[0].envelope,
                Envelope::Request { sync: false, payload: TestMsg::Echo(s), .. } if s == "late"
            ));
        }
        other => panic!("expected batch, got {other:?}"),
    }
    session.close();
}

#[tokio::test]
async fn calls_before_activation_wait_for_it() {
    init_tracing();
    let workers = WorkerGroup::new(1).expect("workers");
    let config = test_config(RecordingDispatcher::new(), app_executor().expect("app executor"))
        .reliable(ReliableConfig::default())
        .build();
    let session = Session::new("early", config, &workers, None).expect("session");
    let (local, remote) = MemTransport::pair();
    session.attach(local);
    let peer = RawPeer::new(remote);

    let reply = session.call(TestMsg::Echo("early".into()));
    peer.expect_quiet(Duration::from_millis(100))
        .await
        .expect("nothing sent while bound");

    assert!(session.try_activate());
    let id = match peer.recv_data(Duration::from_secs(1)).await.expect("batch") {
        Packet::Batch { messages, .. } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].seq, 1);
            match &messages[0].envelope {
                Envelope::Request { id, .. } => *id,
                other => panic!("expected request, got {other:?}"),
            }
        }
        other => panic!("expected batch, got {other:?}"),
    };

    peer.send(Packet::Batch {
        ack: 1,
        messages: vec![Sequenced {
            seq: 1,
            envelope: Envelope::Response {
                id,
                body: Ok(TestMsg::Echo("early".into())),
            },
        }],
    })
    .await
    .expect("respond");
    let result = reply.wait().await.expect("resolved");
    assert_eq!(result, Ok(TestMsg::Echo("early".into())));
    session.close();
}

#[derive(Debug, Clone)]
enum Step {
    Enqueue,
    Release,
    Deliver,
    DeliverLast,
    Lose,
    Duplicate,
    Ack,
    StaleAck(u64),
    Retransmit,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Enqueue),
        2 => Just(Step::Release),
        3 => Just(Step::Deliver),
        1 => Just(Step::DeliverLast),
        1 => Just(Step::Lose),
        1 => Just(Step::Duplicate),
        2 => Just(Step::Ack),
        1 => (0u64..8).prop_map(Step::StaleAck),
        1 => Just(Step::Retransmit),
    ]
}

fn deliver(message: Sequenced<u64>, receiver: &mut MessageQueue<u64>, delivered: &mut Vec<u64>) {
    if receiver.accept(message.seq) {
        if let Envelope::OneWay(n) = message.envelope {
            delivered.push(n);
        }
    }
}

/// Apply `ack`; whatever stays pending was pending before and is newer.
fn acknowledge(sender: &mut MessageQueue<u64>, ack: Seq) -> Result<(), TestCaseError> {
    let before = sender.pending_sequences();
    sender.acknowledge(ack);
    let after = sender.pending_sequences();
    prop_assert!(after.iter().all(|seq| before.contains(seq) && *seq > ack));
    prop_assert_eq!(before.len() - after.len(), before.iter().filter(|&&seq| seq <= ack).count());
    Ok(())
}

proptest! {
    #[test]
    fn lossy_link_delivers_exactly_once_in_order(
        steps in proptest::collection::vec(step(), 1..200),
        max_pending in 1usize..6,
    ) {
        let config = ReliableConfig {
            max_pending_messages: max_pending,
            max_cache_size: 1024,
            ack_timeout: Duration::from_secs(1),
        };
        let mut sender = MessageQueue::<u64>::new(&config);
        let mut receiver = MessageQueue::<u64>::new(&config);
        let mut wire: Vec<Sequenced<u64>> = Vec::new();
        let mut delivered = Vec::new();
        let mut enqueued = 0u64;
        let mut last_ack = 0;
        let now = Instant::now();

        for step in steps {
            match step {
                Step::Enqueue => {
                    enqueued += 1;
                    sender.enqueue(Envelope::OneWay(enqueued));
                }
                Step::Release => wire.extend(sender.release(now)),
                Step::Deliver => {
                    if !wire.is_empty() {
                        let message = wire.remove(0);
                        deliver(message, &mut receiver, &mut delivered);
                    }
                }
                Step::DeliverLast => {
                    if let Some(message) = wire.pop() {
                        deliver(message, &mut receiver, &mut delivered);
                    }
                }
                Step::Lose => {
                    if !wire.is_empty() {
                        wire.remove(0);
                    }
                }
                Step::Duplicate => {
                    if let Some(first) = wire.first().cloned() {
                        wire.push(first);
                    }
                }
                Step::Ack => {
                    let ack = receiver.received();
                    prop_assert!(ack >= last_ack);
                    last_ack = ack;
                    acknowledge(&mut sender, ack)?;
                }
                Step::StaleAck(back) => {
                    // Reordered control packets carry older acks.
                    let ack = receiver.received().saturating_sub(back);
                    acknowledge(&mut sender, ack)?;
                }
                Step::Retransmit => wire.extend(sender.retransmit(now)),
            }
            prop_assert!(sender.pending_len() <= max_pending);
        }

        // Heal the link: retransmit and deliver until everything is acked.
        for _ in 0..=enqueued + 1 {
            wire.clear();
            wire.extend(sender.retransmit(now));
            wire.extend(sender.release(now));
            for message in wire.drain(..) {
                deliver(message, &mut receiver, &mut delivered);
            }
            sender.acknowledge(receiver.received());
        }

        prop_assert_eq!(delivered, (1..=enqueued).collect::<Vec<_>>());
        prop_assert_eq!(sender.pending_len(), 0);
        prop_assert_eq!(sender.cache_len(), 0);
    }
}
