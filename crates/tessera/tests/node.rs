use std::time::Duration;

use tessera::{Node, ReliableConfig, RpcError, SessionState};
use tessera_testkit::{RecordingDispatcher, TestMsg, app_executor, init_tracing, test_config};
use tokio::net::TcpListener;

fn node(dispatcher: std::sync::Arc<RecordingDispatcher>) -> Node<TestMsg> {
    let config = test_config(dispatcher, app_executor().expect("app executor"))
        .reliable(ReliableConfig::default())
        .resumable(true)
        .build();
    Node::new(2, config).expect("node")
}

async fn serving(node: &Node<TestMsg>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let server = node.clone();
    tokio::spawn(async move { server.serve(listener).await });
    addr
}

#[tokio::test]
async fn tcp_round_trip() {
    init_tracing();
    let server_dispatcher = RecordingDispatcher::new();
    let server = node(server_dispatcher.clone());
    let addr = serving(&server).await;
    let client = node(RecordingDispatcher::new());

    let session = client.connect(addr, "player-1").await.expect("connect");
    assert_eq!(session.state(), SessionState::Active);

    let sum = session
        .call(TestMsg::Add(40, 2))
        .wait()
        .await
        .expect("resolved");
    assert_eq!(sum, Ok(TestMsg::Sum(42)));

    session.send(TestMsg::Note(7)).expect("send");
    session.flush().expect("flush");
    let notes = server_dispatcher
        .wait_for_messages(1, Duration::from_secs(2))
        .await
        .expect("note delivered");
    assert_eq!(notes, vec![TestMsg::Note(7)]);
    assert!(server.registry().contains("player-1"));

    client.shutdown();
    session.close_future().wait().await.expect("closed");
    assert!(client.registry().is_empty());
}

#[tokio::test]
async fn resume_reattaches_server_session() {
    init_tracing();
    let server = node(RecordingDispatcher::new());
    let addr = serving(&server).await;
    let client = node(RecordingDispatcher::new());

    let session = client.connect(addr, "player-2").await.expect("connect");
    let resumed = client.resume(&session, addr).await.expect("resume");
    assert!(resumed);
    assert_eq!(server.registry().len(), 1);

    let echoed = session
        .call(TestMsg::Echo("again".into()))
        .wait()
        .await
        .expect("resolved");
    assert_eq!(echoed, Ok(TestMsg::Echo("again".into())));
    session.close();
}

#[tokio::test]
async fn duplicate_client_session_is_refused() {
    init_tracing();
    let server = node(RecordingDispatcher::new());
    let addr = serving(&server).await;
    let client = node(RecordingDispatcher::new());

    let first = client.connect(addr, "twice").await.expect("connect");
    let second = client.connect(addr, "twice").await;
    assert!(matches!(
        second,
        Err(tessera::NodeError::Session(tessera::SessionError::DuplicateId(_)))
    ));
    first.close();
}

#[tokio::test]
async fn connect_to_nothing_fails() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let client = node(RecordingDispatcher::new());
    let result = client.connect(addr, "nobody").await;
    assert!(matches!(result, Err(tessera::NodeError::Io(_))));
    // The failed session unregisters once its teardown runs.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!client.registry().contains("nobody"));
}

#[tokio::test]
async fn call_after_close_is_session_closed() {
    init_tracing();
    let server = node(RecordingDispatcher::new());
    let addr = serving(&server).await;
    let client = node(RecordingDispatcher::new());

    let session = client.connect(addr, "closing").await.expect("connect");
    session.close();
    let result = session.call(TestMsg::Echo("x".into())).wait().await.expect("resolved");
    assert_eq!(result, Err(RpcError::SessionClosed));
}
