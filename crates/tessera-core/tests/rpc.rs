use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tessera_core::transport::mem::MemTransport;
use tessera_core::{
    Envelope, Executor, FaultCode, InlineExecutor, Packet, ReliableConfig, RemoteFault, RpcError,
    Session, WorkerGroup,
};
use tessera_testkit::{
    CountingExecutor, Harness, MemFactory, RawPeer, RecordingDispatcher, TestMsg, init_tracing,
    test_config,
};

#[tokio::test]
async fn unanswered_call_times_out_after_deadline() {
    init_tracing();
    let harness = Harness::connect::<MemFactory, _>("timeout", |c| {
        c.sync_rpc_timeout(Duration::from_millis(100))
    })
    .await
    .expect("harness");

    let started = Instant::now();
    let result = harness
        .client
        .call(TestMsg::Silent)
        .wait()
        .await
        .expect("resolved");
    let elapsed = started.elapsed();

    assert_eq!(result, Err(RpcError::Timeout));
    assert!(elapsed >= Duration::from_millis(100), "resolved early: {elapsed:?}");
    // One sweep interval late at most, with scheduling slack.
    assert!(elapsed < Duration::from_millis(300), "resolved late: {elapsed:?}");
    assert!(harness.client.is_active());
}

#[tokio::test]
async fn reliable_async_traffic_needs_no_flush() {
    init_tracing();
    let harness = Harness::connect::<MemFactory, _>("unflushed", |c| {
        c.reliable(ReliableConfig::default())
            .async_rpc_timeout(Duration::from_millis(800))
    })
    .await
    .expect("harness");

    // Both the request and the async-flagged response stay below the
    // release threshold.
    let (tx, rx) = tokio::sync::oneshot::channel();
    harness.client.call_async(TestMsg::Echo("hi".into()), move |result| {
        let _ = tx.send(result);
    });
    let result = tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .expect("callback ran")
        .expect("callback sent");
    assert_eq!(result, Ok(TestMsg::Echo("hi".into())));
    assert_eq!(harness.server_dispatcher.requests(), 1);

    harness.client.send(TestMsg::Note(1)).expect("send");
    harness
        .server_dispatcher
        .wait_for_messages(1, Duration::from_secs(1))
        .await
        .expect("delivered without flush");
    assert_eq!(harness.server_dispatcher.messages(), vec![TestMsg::Note(1)]);
}

#[tokio::test]
async fn dropped_response_channel_answers_internal_fault() {
    init_tracing();
    let harness = Harness::connect::<MemFactory, _>("dropped", |c| c)
        .await
        .expect("harness");

    let result = harness
        .client
        .call(TestMsg::Drop)
        .wait()
        .await
        .expect("resolved");
    match result {
        Err(RpcError::Remote(fault)) => assert_eq!(fault.code, FaultCode::Internal),
        other => panic!("expected internal fault, got {other:?}"),
    }
}

#[tokio::test]
async fn sync_call_from_application_thread() {
    init_tracing();
    let harness = Harness::connect::<MemFactory, _>("sync", |c| c)
        .await
        .expect("harness");

    let client = harness.client.clone();
    let answer = tokio::task::spawn_blocking(move || client.sync_call(TestMsg::Add(1, 2)))
        .await
        .expect("join");
    assert_eq!(answer, Ok(TestMsg::Sum(3)));
}

#[tokio::test]
async fn late_response_after_timeout_is_ignored() {
    init_tracing();
    let workers = WorkerGroup::new(1).expect("workers");
    let config = test_config(RecordingDispatcher::new(), Arc::new(InlineExecutor))
        .sync_rpc_timeout(Duration::from_millis(50))
        .build();
    let session = Session::new("late", config, &workers, None).expect("session");
    let (local, remote) = MemTransport::<TestMsg>::pair();
    session.attach(local);
    session.try_activate();
    let peer = RawPeer::new(remote);

    let promise = session.call(TestMsg::Echo("slow".into()));
    let id = match peer.recv_data(Duration::from_secs(1)).await.expect("request") {
        Packet::Direct(Envelope::Request { id, sync: true, .. }) => id,
        other => panic!("expected request, got {other:?}"),
    };
    assert_eq!(promise.wait().await.expect("resolved"), Err(RpcError::Timeout));

    peer.send(Packet::Direct(Envelope::Response {
        id,
        body: Ok(TestMsg::Echo("slow".into())),
    }))
    .await
    .expect("send");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(
        promise.get_now(),
        Some(Ok(Err(RpcError::Timeout)))
    ));
    assert!(session.is_active());
    session.close();
}

#[tokio::test]
async fn remote_fault_reaches_caller() {
    init_tracing();
    let workers = WorkerGroup::new(1).expect("workers");
    let config = test_config(RecordingDispatcher::new(), Arc::new(InlineExecutor)).build();
    let session = Session::new("fault", config, &workers, None).expect("session");
    let (local, remote) = MemTransport::<TestMsg>::pair();
    session.attach(local);
    session.try_activate();
    let peer = RawPeer::new(remote);

    let promise = session.call(TestMsg::Echo("x".into()));
    let Packet::Direct(Envelope::Request { id, .. }) =
        peer.recv_data(Duration::from_secs(1)).await.expect("request")
    else {
        panic!("expected request");
    };
    peer.send(Packet::Direct(Envelope::Response {
        id,
        body: Err(RemoteFault::new(FaultCode::NotFound, "no such thing")),
    }))
    .await
    .expect("send");

    match promise.wait().await.expect("resolved") {
        Err(RpcError::Remote(fault)) => {
            assert_eq!(fault.code, FaultCode::NotFound);
            assert_eq!(fault.message, "no such thing");
        }
        other => panic!("expected remote fault, got {other:?}"),
    }
    session.close();
}

#[tokio::test]
async fn forced_close_fails_pending_callbacks_in_one_job() {
    init_tracing();
    let workers = WorkerGroup::new(1).expect("workers");
    let counting = CountingExecutor::inline();
    let executor: Arc<dyn Executor> = counting.clone();
    let config = test_config(RecordingDispatcher::new(), executor)
        .async_rpc_timeout(Duration::from_secs(30))
        .build();
    let session = Session::new("forced", config, &workers, None).expect("session");
    let (local, remote) = MemTransport::<TestMsg>::pair();
    session.attach(local);
    session.try_activate();
    let peer = RawPeer::new(remote);

    let results = Arc::new(Mutex::new(Vec::new()));
    for n in 0..3 {
        let results = results.clone();
        session.call_async(TestMsg::Note(n), move |result| {
            results.lock().push((n, result));
        });
    }
    for _ in 0..3 {
        match peer.recv_data(Duration::from_secs(1)).await.expect("request") {
            Packet::Direct(Envelope::Request { sync: false, .. }) => {}
            other => panic!("expected async request, got {other:?}"),
        }
    }

    let jobs_before = counting.jobs();
    assert!(session.close_forcibly());
    session.close_future().wait().await.expect("closed");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let results = results.lock().clone();
    assert_eq!(results.len(), 3, "each callback runs exactly once");
    assert!(results.iter().all(|(_, r)| *r == Err(RpcError::SessionClosed)));
    assert_eq!(counting.jobs() - jobs_before, 1);
}

#[tokio::test]
async fn graceful_close_resolves_pending_promises() {
    init_tracing();
    let harness = Harness::connect::<MemFactory, _>("graceful-pending", |c| c)
        .await
        .expect("harness");

    let pending = harness.client.call(TestMsg::Silent);
    // Wait until the server has the request, so the call is in flight.
    let deadline = Instant::now() + Duration::from_secs(1);
    while harness.server_dispatcher.requests() == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    harness.client.close();

    assert_eq!(
        pending.wait().await.expect("resolved"),
        Err(RpcError::SessionClosed)
    );
}
