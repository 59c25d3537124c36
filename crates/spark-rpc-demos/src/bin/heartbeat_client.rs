//! 心跳客户端演示：建立到提供者的长连接，周期性发送请求，空闲时由传输层自动发送心跳。
//!
//! # 使用方法
//! ```bash
//! RUST_LOG=spark_transport_rpc=debug,info cargo run --bin heartbeat_client -- 127.0.0.1:18090
//! ```
//! - 省略地址时在本地启动一个应答提供者，每收到 5 个请求主动断开一次连接，用于观察重连日志；
//! - `Ctrl+C` 退出。

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use spark_codec_rpc::{Frame, FrameDecoder, MessageKind};
use spark_transport_rpc::{Connection, Connector, ConnectorConfig, MessageHandler};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const REQUEST_INTERVAL: Duration = Duration::from_secs(2);
const REQUESTS_PER_SESSION: u64 = 5;

struct LogResponses;

impl MessageHandler for LogResponses {
    fn on_frame(&self, connection: &Connection, frame: Frame) {
        info!(
            connection = %connection.id(),
            id = frame.header().id(),
            kind = ?frame.header().kind(),
            payload = %String::from_utf8_lossy(frame.payload()),
            "response received"
        );
    }

    fn on_active(&self, connection: &Connection) {
        info!(connection = %connection.id(), local = %connection.local_addr(), "session active");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let remote = match env::args().nth(1) {
        Some(raw) => raw
            .parse::<SocketAddr>()
            .with_context(|| format!("`{raw}` is not a socket address"))?,
        None => spawn_local_provider().await?,
    };

    let config = ConnectorConfig {
        writer_idle_seconds: 1,
        ..ConnectorConfig::default()
    };
    let connector = Connector::new(config, Arc::new(LogResponses))
        .context("failed to start the connector")?;
    connector.connect(remote).await?;

    let mut ticker = tokio::time::interval(REQUEST_INTERVAL);
    let mut next_id = 1u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let Some(connection) = connector.group().next_active(remote) else {
                    debug!(remote = %remote, "no active connection, waiting for reconnect");
                    continue;
                };
                let frame = Frame::new(MessageKind::REQUEST, 0, next_id, Bytes::from_static(b"ping"))?;
                if let Err(error) = connection.write_frame(frame) {
                    warn!(error = %error, "request not sent");
                }
                next_id += 1;
            }
        }
    }

    info!(closed = connector.close_all(), "shutting down");
    connector.shutdown();
    Ok(())
}

async fn spawn_local_provider() -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind the local provider")?;
    let addr = listener.local_addr()?;
    info!(addr = %addr, "local provider listening");
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(async move {
                        if let Err(error) = serve(stream).await {
                            warn!(peer = %peer, error = %error, "provider session failed");
                        }
                    });
                }
                Err(error) => {
                    warn!(error = %error, "provider accept failed");
                    return;
                }
            }
        }
    });
    Ok(addr)
}

async fn serve(mut stream: TcpStream) -> anyhow::Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::new();
    let mut answered = 0u64;
    loop {
        while let Some(frame) = decoder.decode(&mut buf)? {
            if frame.header().kind() == MessageKind::HEARTBEAT {
                debug!("provider saw a heartbeat");
                continue;
            }
            let reply = Frame::new(
                MessageKind::RESPONSE,
                0,
                frame.header().id(),
                Bytes::from_static(b"pong"),
            )?;
            stream.write_all(&reply.encode()).await?;
            answered += 1;
            if answered == REQUESTS_PER_SESSION {
                info!("provider drops the session");
                return Ok(());
            }
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}
