//! tether-agent — serves the executor singleton to a controller.
//!
//! Usage: `tether-agent [stdio|listen|connect] [address]`. Both arguments
//! fall back to the `[agent]` config section. Logs go to stderr; in stdio
//! mode stdout carries the protocol.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};

use tether_channel::duplex::{ByteDuplex, Framing, StreamDuplex};
use tether_channel::rpc::{RpcChannel, Singletons};
use tether_core::config::TetherConfig;

mod tasks;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut config = TetherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TetherConfig::default()
    });

    let mut args = std::env::args().skip(1);
    let transport = args.next().unwrap_or_else(|| config.agent.transport.clone());
    let address = args.next().unwrap_or_else(|| config.agent.address.clone());
    // Only a listening agent can receive a replacement stream.
    if transport != "listen" {
        config.pipe.reconnect = false;
    }
    let framing = if config.agent.envelope {
        Framing::Envelope {
            chunk_capacity: config.envelope.chunk_capacity,
        }
    } else {
        Framing::Raw
    };

    let singletons = Singletons::new();
    let builtins = tasks::builtin();
    tracing::info!(tasks = ?builtins.names(), "executor ready");
    builtins.install(&singletons)?;

    let channel = RpcChannel::builder("agent")
        .config(config)
        .singletons(singletons)
        .build()
        .context("failed to build rpc channel")?;

    match transport.as_str() {
        "stdio" => {
            tracing::info!("tether-agent serving on stdio");
            channel.attach_stream(Arc::new(StreamDuplex::stdio(framing)))?;
        }
        "connect" => {
            let stream = TcpStream::connect(&address)
                .await
                .with_context(|| format!("failed to connect to {address}"))?;
            tracing::info!(address, "tether-agent connected");
            channel.attach_stream(Arc::new(StreamDuplex::tcp(stream, framing)))?;
        }
        "listen" => {
            let listener = TcpListener::bind(&address)
                .await
                .with_context(|| format!("failed to bind {address}"))?;
            tracing::info!(address, "tether-agent listening");
            tokio::spawn(accept_loop(listener, channel.clone(), framing));
        }
        other => bail!("unknown transport {other:?}, expected stdio, listen or connect"),
    }

    tokio::select! {
        _ = channel.terminated() => {
            tracing::info!("channel terminated");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to wait for ctrl-c")?;
            tracing::info!("interrupted, shutting down");
            channel.close();
        }
    }
    Ok(())
}

/// Each accepted connection replaces the previous stream. With
/// `pipe.reconnect` set, unacknowledged messages resume on the new one.
async fn accept_loop(listener: TcpListener, channel: RpcChannel, framing: Framing) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if channel.is_terminated() {
            break;
        }
        tracing::info!(%peer, "controller connected");
        let duplex: Arc<dyn ByteDuplex> = Arc::new(StreamDuplex::tcp(stream, framing));
        if let Err(e) = channel.attach_stream(duplex) {
            tracing::warn!(%peer, error = %e, "failed to attach stream");
            break;
        }
    }
}
