use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{Agent, unix_millis};

/// Outbound channel sender type. Frames are fully encoded packets.
pub type OutboundTx = mpsc::Sender<Bytes>;

/// Spawn the writer task for one connection.
///
/// Writes queued frames in order and sends a heartbeat every `heartbeat`.
/// Closes the agent when the peer has been silent for two heartbeats, a
/// write fails, or a single write stays blocked for two heartbeats. Once the
/// agent is closed, frames already queued (such as a kick) are flushed for
/// at most one heartbeat before the task exits.
pub fn spawn_writer<S>(
    mut write: S,
    mut rx: mpsc::Receiver<Bytes>,
    agent: Arc<Agent>,
    heartbeat: Duration,
) -> tokio::task::JoinHandle<anyhow::Result<()>>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let cancel = agent.cancel_token().clone();
        let heartbeat_frame = agent.context().frames().heartbeat.clone();
        let stall_limit = heartbeat * 2;
        let timeout_ms = stall_limit.as_millis() as i64;
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let res = loop {
            let frame = tokio::select! {
                biased;

                _ = cancel.cancelled() => break drain(&mut write, &mut rx, heartbeat).await,

                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break Ok(()),
                },

                _ = ticker.tick() => {
                    let idle = unix_millis() - agent.last_at();
                    if idle > timeout_ms {
                        debug!(conn_id = agent.conn_id(), peer = %agent.peer(), idle_ms = idle, "Heartbeat timeout");
                        agent.close().await;
                        continue;
                    }
                    heartbeat_frame.clone()
                }
            };

            match write_frame(&mut write, frame, &cancel, stall_limit).await {
                Some(Ok(())) => {}
                Some(Err(e)) => break Err(e),
                None => break drain(&mut write, &mut rx, heartbeat).await,
            }
        };

        if let Err(e) = &res {
            warn!(conn_id = agent.conn_id(), peer = %agent.peer(), error = %e, "Write failed");
            agent.close().await;
        }
        let _ = timeout(heartbeat, write.close()).await;
        res.map_err(Into::into)
    })
}

/// Write one frame. Returns `None` if the agent was closed first.
async fn write_frame<S>(
    write: &mut S,
    frame: Bytes,
    cancel: &CancellationToken,
    limit: Duration,
) -> Option<std::io::Result<()>>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    tokio::select! {
        biased;

        _ = cancel.cancelled() => None,

        res = timeout(limit, write.send(frame)) => Some(res.unwrap_or_else(|_| Err(stalled()))),
    }
}

async fn drain<S>(
    write: &mut S,
    rx: &mut mpsc::Receiver<Bytes>,
    limit: Duration,
) -> std::io::Result<()>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    rx.close();
    let flush = async {
        while let Some(frame) = rx.recv().await {
            write.feed(frame).await?;
        }
        write.flush().await
    };
    timeout(limit, flush).await.unwrap_or_else(|_| Err(stalled()))
}

fn stalled() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, "peer stopped reading")
}

#[cfg(test)]
mod tests {
    use futures_util::sink;

    use super::*;
    use crate::agent::AgentState;
    use crate::config::ServerConfig;
    use crate::server::ServerBuilder;
    use crate::test_support::parts;

    /// Sink that records every written frame.
    fn recording_sink() -> (
        impl Sink<Bytes, Error = std::io::Error> + Unpin + Send + 'static,
        mpsc::UnboundedReceiver<Bytes>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = sink::unfold(tx, |tx, frame: Bytes| async move {
            tx.send(frame).map_err(std::io::Error::other)?;
            Ok::<_, std::io::Error>(tx)
        });
        (Box::pin(sink), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn idle_peer_is_closed_after_two_intervals() {
        let (ctx, _dispatch) = parts(ServerBuilder::new(ServerConfig::default()));
        let (tx, rx) = mpsc::channel(16);
        let agent = Agent::new(ctx, 1, "127.0.0.1:1".parse().unwrap(), tx);
        let (write, mut written) = recording_sink();

        // Activity is wall-clock millis while the test clock is paused.
        agent.set_last_at(unix_millis() - 90_000);
        let writer = spawn_writer(write, rx, Arc::clone(&agent), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(31)).await;
        writer.await.unwrap().unwrap();
        assert_eq!(agent.state(), AgentState::Closed);
        assert!(written.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_frame_is_written_while_peer_is_active() {
        let (ctx, _dispatch) = parts(ServerBuilder::new(ServerConfig::default()));
        let (tx, rx) = mpsc::channel(16);
        let agent = Agent::new(Arc::clone(&ctx), 1, "127.0.0.1:1".parse().unwrap(), tx);
        let (write, mut written) = recording_sink();
        let _writer = spawn_writer(write, rx, Arc::clone(&agent), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(written.recv().await.unwrap(), ctx.frames().heartbeat);
        assert_eq!(agent.state(), AgentState::Start);
    }

    #[tokio::test]
    async fn close_flushes_queued_frames() {
        let (ctx, _dispatch) = parts(ServerBuilder::new(ServerConfig::default()));
        let (tx, rx) = mpsc::channel(16);
        let agent = Agent::new(ctx, 1, "127.0.0.1:1".parse().unwrap(), tx.clone());

        tx.send(Bytes::from_static(b"one")).await.unwrap();
        tx.send(Bytes::from_static(b"two")).await.unwrap();
        agent.close().await;

        let (write, mut written) = recording_sink();
        spawn_writer(write, rx, Arc::clone(&agent), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let mut frames = Vec::new();
        while let Some(frame) = written.recv().await {
            frames.push(frame);
        }
        assert_eq!(frames, [Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
    }

    /// Sink whose writes never complete, like a peer that stopped reading.
    fn stalled_sink() -> impl Sink<Bytes, Error = std::io::Error> + Unpin + Send + 'static {
        Box::pin(sink::unfold((), |(), _frame: Bytes| {
            futures_util::future::pending::<std::io::Result<()>>()
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_writer_blocked_on_stalled_peer() {
        let (ctx, _dispatch) = parts(ServerBuilder::new(ServerConfig::default()));
        let (tx, rx) = mpsc::channel(16);
        let agent = Agent::new(ctx, 1, "127.0.0.1:1".parse().unwrap(), tx.clone());
        let writer = spawn_writer(stalled_sink(), rx, Arc::clone(&agent), Duration::from_secs(30));

        tx.send(Bytes::from_static(b"stuck")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        agent.close().await;
        assert_eq!(agent.state(), AgentState::Closed);

        let res = tokio::time::timeout(Duration::from_secs(120), writer)
            .await
            .expect("writer should stop after close")
            .unwrap();
        assert!(res.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_closes_the_agent() {
        let (ctx, _dispatch) = parts(ServerBuilder::new(ServerConfig::default()));
        let (tx, rx) = mpsc::channel(16);
        let agent = Agent::new(ctx, 1, "127.0.0.1:1".parse().unwrap(), tx.clone());
        let writer = spawn_writer(stalled_sink(), rx, Arc::clone(&agent), Duration::from_secs(30));

        tx.send(Bytes::from_static(b"stuck")).await.unwrap();

        let res = tokio::time::timeout(Duration::from_secs(300), writer)
            .await
            .expect("stalled writer should give up")
            .unwrap();
        let err = res.unwrap_err();
        let io = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);
        assert_eq!(agent.state(), AgentState::Closed);
    }
}
