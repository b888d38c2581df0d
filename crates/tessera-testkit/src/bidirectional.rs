//! Bidirectional RPC scenarios.
//!
//! Both ends of a session may issue calls. These scenarios check that the
//! server can call the client, and that a handler may call back into the
//! peer before answering.
//!
//! # Usage
//!
//! ```ignore
//! use tessera_testkit::bidirectional::{run_bidirectional_scenario, BidirectionalScenario};
//!
//! #[tokio::test]
//! async fn nested() {
//!     run_bidirectional_scenario::<MemFactory>(BidirectionalScenario::NestedCallback).await;
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{Harness, TestError, TestMsg, TransportFactory, init_tracing};

/// Scenarios for bidirectional RPC testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidirectionalScenario {
    /// The server calls the client.
    ServerCallsClient,

    /// The client calls the server, which calls the client back before
    /// answering.
    NestedCallback,

    /// Many asynchronous calls in both directions at once.
    ConcurrentBothWays,
}

/// Run a bidirectional RPC scenario.
pub async fn run_bidirectional_scenario<F: TransportFactory>(scenario: BidirectionalScenario) {
    init_tracing();
    let result = match scenario {
        BidirectionalScenario::ServerCallsClient => run_server_calls_client::<F>().await,
        BidirectionalScenario::NestedCallback => run_nested_callback::<F>().await,
        BidirectionalScenario::ConcurrentBothWays => run_concurrent_both_ways::<F>().await,
    };

    if let Err(e) = result {
        panic!("bidirectional scenario {scenario:?} failed: {e}");
    }
}

async fn run_server_calls_client<F: TransportFactory>() -> Result<(), TestError> {
    let harness = Harness::connect::<F, _>("server-calls", |c| c).await?;

    let answer = harness
        .server
        .call(TestMsg::Add(20, 22))
        .wait()
        .await
        .map_err(|e| TestError::Setup(e.to_string()))??;
    if answer != TestMsg::Sum(42) {
        return Err(TestError::Assertion(format!("expected Sum(42), got {answer:?}")));
    }
    if harness.client_dispatcher.requests() != 1 {
        return Err(TestError::Assertion(format!(
            "client handled {} requests, expected 1",
            harness.client_dispatcher.requests()
        )));
    }
    Ok(())
}

async fn run_nested_callback<F: TransportFactory>() -> Result<(), TestError> {
    let harness = Harness::connect::<F, _>("nested", |c| c).await?;

    let answer = harness
        .client
        .call(TestMsg::Callback("ping".into()))
        .wait()
        .await
        .map_err(|e| TestError::Setup(e.to_string()))??;
    if answer != TestMsg::Echo("ping".into()) {
        return Err(TestError::Assertion(format!("unexpected answer {answer:?}")));
    }

    // The server handled the outer call; the client handled the callback.
    if harness.server_dispatcher.requests() != 1 || harness.client_dispatcher.requests() != 1 {
        return Err(TestError::Assertion(format!(
            "request counts: server {}, client {}",
            harness.server_dispatcher.requests(),
            harness.client_dispatcher.requests()
        )));
    }
    Ok(())
}

async fn run_concurrent_both_ways<F: TransportFactory>() -> Result<(), TestError> {
    let harness = Harness::connect::<F, _>("concurrent", |c| c).await?;

    const CALLS: i32 = 16;
    let results = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Arc::new(Mutex::new(Some(done_tx)));

    for n in 0..CALLS {
        for (side, session) in [("client", &harness.client), ("server", &harness.server)] {
            let results = results.clone();
            let done_tx = done_tx.clone();
            session.call_async(TestMsg::Add(n, n), move |result| {
                let mut results = results.lock();
                results.push((side, n, result));
                if results.len() == (CALLS * 2) as usize {
                    if let Some(tx) = done_tx.lock().take() {
                        let _ = tx.send(());
                    }
                }
            });
        }
    }

    tokio::time::timeout(Duration::from_secs(5), done_rx)
        .await
        .map_err(|_| TestError::Assertion("calls did not all complete".into()))?
        .map_err(|_| TestError::Assertion("completion signal dropped".into()))?;

    for (side, n, result) in results.lock().iter() {
        match result {
            Ok(TestMsg::Sum(sum)) if *sum == n * 2 => {}
            other => {
                return Err(TestError::Assertion(format!(
                    "{side} call {n} resolved with {other:?}"
                )));
            }
        }
    }
    Ok(())
}
