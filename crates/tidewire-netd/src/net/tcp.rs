use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite};
use tokio_util::codec::{BytesCodec, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::context::ServerContext;

use super::framing::PacketFramer;
use super::inbound::{ConnId, TransportKind};
use super::outbound::spawn_writer;
use super::stream_adapter::WebSocketStream;

/// Run the accept loop on an existing listener.
pub async fn run_tcp_listener(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            res = listener.accept() => res?,
            _ = shutdown.cancelled() => return Ok(()),
        };

        let conn_id = ctx.next_conn_id();
        let ctx = Arc::clone(&ctx);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            handle_tcp_connection(stream, peer, conn_id, ctx, shutdown).await;
        });
    }
}

/// Serve one accepted connection until either side closes it.
pub async fn handle_tcp_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: ConnId,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
) {
    let _ = stream.set_nodelay(true);

    let mut peek_buf = [0u8; 4];
    let transport = match stream.peek(&mut peek_buf).await {
        Ok(n) => TransportKind::sniff(&peek_buf[..n]),
        Err(e) => {
            warn!(conn_id, %peer, error = %e, "Failed to peek stream");
            return;
        }
    };

    match transport {
        TransportKind::WebSocket => match accept_async(stream).await {
            Ok(ws_stream) => {
                let (write, read) = ws_stream.split();
                let sink = write
                    .sink_map_err(std::io::Error::other)
                    .with(|frame: Bytes| std::future::ready(Ok(tungstenite::Message::Binary(frame))));
                let read = WebSocketStream::new(read);
                handle_connection_inner(read, sink, peer, conn_id, transport, ctx, shutdown).await;
            }
            Err(e) => {
                warn!(conn_id, %peer, error = %e, "WebSocket handshake failed");
            }
        },
        TransportKind::Tcp => {
            let (read, write) = stream.into_split();
            let sink = FramedWrite::new(write, BytesCodec::new());
            handle_connection_inner(read, sink, peer, conn_id, transport, ctx, shutdown).await;
        }
    }
}

async fn handle_connection_inner<R, S>(
    mut read: R,
    write: S,
    peer: SocketAddr,
    conn_id: ConnId,
    transport: TransportKind,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
    S: Sink<Bytes, Error = std::io::Error> + Unpin + Send + 'static,
{
    let config = ctx.config();
    let (out_tx, out_rx) = mpsc::channel(config.write_backlog.max(1));
    let agent = Agent::new(Arc::clone(&ctx), conn_id, peer, out_tx);
    let writer = spawn_writer(write, out_rx, Arc::clone(&agent), config.heartbeat);
    let cancel = agent.cancel_token().clone();

    info!(
        conn_id,
        %peer,
        ?transport,
        session_id = agent.session().id(),
        "New session established"
    );

    let mut framer = PacketFramer::new(config.read_chunk);

    let disconnect_reason = loop {
        if framer.buffered() > config.max_buffered {
            break format!("rx buffer exceeded limit ({} bytes)", config.max_buffered);
        }

        framer.buf_mut().reserve(config.read_chunk);
        let read_res = tokio::select! {
            res = read.read_buf(framer.buf_mut()) => res,
            _ = cancel.cancelled() => break "closed by server".to_string(),
            _ = shutdown.cancelled() => break "server shutdown".to_string(),
        };

        match read_res {
            Ok(0) => break "eof".to_string(),
            Ok(_) => {}
            Err(e) => break format!("read error: {e}"),
        }

        let packets = match framer.drain_packets() {
            Ok(packets) => packets,
            Err(e) => break format!("protocol error: {e}"),
        };

        let mut failed = None;
        for packet in packets {
            if let Err(e) = agent.process_packet(packet).await {
                failed = Some(e);
                break;
            }
        }
        if let Some(e) = failed {
            break format!("processing error: {e}");
        }
    };

    agent.close().await;
    info!(
        conn_id,
        %peer,
        session_id = agent.session().id(),
        uid = agent.session().uid(),
        reason = %disconnect_reason,
        "Session disconnected"
    );

    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(conn_id, error = %e, "Writer ended with error"),
        Err(e) => warn!(conn_id, error = %e, "Writer task failed"),
    }
}
