//! Echo node
//!
//! Runs either side of a tessera session over TCP.
//!
//! # Usage
//!
//! ```bash
//! echo-server serve --addr 127.0.0.1:7000
//! echo-server call --addr 127.0.0.1:7000 --session alice --count 5
//! ```
//!
//! Set `RUST_LOG=debug` to watch handshakes, acks and closes.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tessera::prelude::*;
use tessera::FaultCode;
use tessera::RemoteFault;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "echo-server")]
#[command(about = "tessera echo node")]
struct Args {
    /// Session worker threads
    #[arg(long, default_value_t = 2, env = "TESSERA_WORKERS")]
    workers: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept sessions and echo every request
    Serve {
        #[arg(short, long, default_value = "127.0.0.1:7000")]
        addr: SocketAddr,
    },
    /// Open a session and issue echo calls
    Call {
        #[arg(short, long, default_value = "127.0.0.1:7000")]
        addr: SocketAddr,

        /// Session id to open
        #[arg(short, long, default_value = "echo-client")]
        session: String,

        /// Number of calls
        #[arg(short, long, default_value_t = 3)]
        count: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum EchoMsg {
    Say(String),
    Said(String),
    Chat(String),
}

struct Echo;

impl Dispatcher<EchoMsg> for Echo {
    fn post_rpc_request(
        &self,
        session: &Session<EchoMsg>,
        payload: EchoMsg,
        channel: ResponseChannel<EchoMsg>,
    ) {
        match payload {
            EchoMsg::Say(text) => {
                tracing::info!(session_id = %session.id(), %text, "echo");
                channel.write(EchoMsg::Said(text));
            }
            other => channel.fail(RemoteFault::new(
                FaultCode::InvalidArgument,
                format!("cannot answer {other:?}"),
            )),
        }
    }

    fn post_one_way_message(&self, session: &Session<EchoMsg>, payload: EchoMsg) {
        tracing::info!(session_id = %session.id(), ?payload, "message");
    }
}

fn node(workers: usize) -> anyhow::Result<Node<EchoMsg>> {
    let config = SessionConfig::builder(Arc::new(Echo), Arc::new(TokioExecutor::current()))
        .reliable(ReliableConfig::default())
        .resumable(true)
        .build();
    Node::new(workers, config).context("failed to start session workers")
}

async fn serve(workers: usize, addr: SocketAddr) -> anyhow::Result<()> {
    let node = node(workers)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tokio::select! {
        result = node.serve(listener) => result.context("listener failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(sessions = node.registry().len(), "shutting down");
            node.shutdown();
        }
    }
    Ok(())
}

async fn call(workers: usize, addr: SocketAddr, session_id: String, count: u32) -> anyhow::Result<()> {
    let node = node(workers)?;
    let session = node
        .connect(addr, session_id)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;

    session.send(EchoMsg::Chat("hello".into()))?;
    for n in 0..count {
        let started = Instant::now();
        let reply = session
            .call(EchoMsg::Say(format!("message {n}")))
            .wait()
            .await
            .context("call abandoned")??;
        tracing::info!(?reply, elapsed_us = started.elapsed().as_micros() as u64, "reply");
    }

    session.close();
    tokio::time::timeout(Duration::from_secs(2), session.close_future().wait())
        .await
        .context("close did not complete")?
        .context("close failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match args.command {
        Command::Serve { addr } => serve(args.workers, addr).await,
        Command::Call {
            addr,
            session,
            count,
        } => call(args.workers, addr, session, count).await,
    }
}
