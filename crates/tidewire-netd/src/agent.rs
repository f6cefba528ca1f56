//! Per-connection protocol state machine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use strum::FromRepr;
use tidewire_netproto::{
    codec::encode_packet,
    handshake::HandshakeRequest,
    message::{self, Message},
    packet::{Packet, PacketType},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::error::ServerError;
use crate::handler::router::process_message;
use crate::net::inbound::ConnId;
use crate::net::outbound::OutboundTx;
use crate::serialize::SerializeError;
use crate::session::Session;

/// Protocol phase of a connection. Phases only move forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromRepr)]
pub enum AgentState {
    /// Accepted, waiting for the client's handshake.
    Start = 0,
    /// Handshake answered, waiting for the client's ack.
    HandshakeAckPending = 1,
    /// Data packets are accepted.
    Working = 2,
    /// Terminal.
    Closed = 3,
}

/// Server-side state of one client connection.
///
/// Mutated by the connection's reader and by whoever closes it. All outbound
/// bytes go through `outbound` to the connection's writer task.
pub struct Agent {
    conn_id: ConnId,
    peer: SocketAddr,
    session: Arc<Session>,
    state: AtomicU8,
    /// Unix millis of the last successfully processed packet.
    last_at: AtomicI64,
    /// Id of the last request handed to a handler.
    last_mid: AtomicU64,
    outbound: OutboundTx,
    cancel: CancellationToken,
    ctx: Arc<ServerContext>,
}

impl Agent {
    pub(crate) fn new(
        ctx: Arc<ServerContext>,
        conn_id: ConnId,
        peer: SocketAddr,
        outbound: OutboundTx,
    ) -> Arc<Self> {
        let session_id = ctx.next_session_id();
        Arc::new_cyclic(|weak| Self {
            conn_id,
            peer,
            session: Arc::new(Session::new(session_id, weak.clone())),
            state: AtomicU8::new(AgentState::Start as u8),
            last_at: AtomicI64::new(unix_millis()),
            last_mid: AtomicU64::new(0),
            outbound,
            cancel: CancellationToken::new(),
            ctx,
        })
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn state(&self) -> AgentState {
        AgentState::from_repr(self.state.load(Ordering::Acquire)).unwrap_or(AgentState::Closed)
    }

    /// Move `from` → `to`; fails if the phase changed meanwhile, e.g. closed.
    fn transition(&self, from: AgentState, to: AgentState) -> Result<(), ServerError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(|_| ServerError::SessionClosed)
    }

    pub fn last_at(&self) -> i64 {
        self.last_at.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn set_last_at(&self, millis: i64) {
        self.last_at.store(millis, Ordering::Relaxed);
    }

    pub fn last_mid(&self) -> u64 {
        self.last_mid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_mid(&self, mid: u64) {
        self.last_mid.store(mid, Ordering::Relaxed);
    }

    pub(crate) fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one decoded packet through the state machine.
    ///
    /// An error is fatal to the connection.
    pub(crate) async fn process_packet(self: &Arc<Self>, packet: Packet) -> Result<(), ServerError> {
        let state = self.state();
        match packet.kind {
            PacketType::Handshake => {
                if state != AgentState::Start {
                    return Err(self.violation(state, packet.kind));
                }
                if !self.handshake(&packet.data).await? {
                    return Ok(());
                }
            }

            PacketType::HandshakeAck => match state {
                AgentState::HandshakeAckPending => {
                    self.transition(AgentState::HandshakeAckPending, AgentState::Working)?;
                    debug!(
                        conn_id = self.conn_id,
                        peer = %self.peer,
                        session_id = self.session.id(),
                        "Received handshake ack"
                    );
                }
                AgentState::Working => {}
                _ => return Err(self.violation(state, packet.kind)),
            },

            PacketType::Heartbeat => {
                if state == AgentState::Closed {
                    return Err(ServerError::SessionClosed);
                }
            }

            PacketType::Data => {
                if state != AgentState::Working {
                    return Err(self.violation(state, packet.kind));
                }
                let msg = message::decode(&packet.data, self.ctx.registry().dict())?;
                process_message(&self.ctx, self, msg).await?;
            }

            PacketType::Kick => return Err(self.violation(state, packet.kind)),
        }

        self.last_at.store(unix_millis(), Ordering::Relaxed);
        Ok(())
    }

    /// Returns `false` when the client was rejected and the connection closed.
    async fn handshake(&self, body: &[u8]) -> Result<bool, ServerError> {
        let request = match HandshakeRequest::from_json(body) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(conn_id = self.conn_id, peer = %self.peer, error = %e, "Bad handshake payload");
                None
            }
        };

        if let Some(auth) = self.ctx.auth()
            && let Some(reason) = auth(self.session.as_ref(), request.as_ref())
        {
            info!(conn_id = self.conn_id, peer = %self.peer, "Handshake rejected");
            let sent = self.kick(&reason).await;
            self.close().await;
            sent?;
            return Ok(false);
        }

        self.send_frame(self.ctx.frames().handshake_response.clone()).await?;
        self.transition(AgentState::Start, AgentState::HandshakeAckPending)?;
        self.session.set_authenticated(true);
        debug!(
            conn_id = self.conn_id,
            peer = %self.peer,
            session_id = self.session.id(),
            "Session handshake"
        );
        Ok(true)
    }

    /// Queue a message for the writer, after the outbound pipeline.
    pub(crate) async fn send(&self, mut msg: Message) -> Result<(), ServerError> {
        if self.state() == AgentState::Closed {
            return Err(ServerError::SessionClosed);
        }
        msg.data = self
            .ctx
            .pipeline()
            .run_outbound(&self.session, msg.data)
            .map_err(ServerError::Pipeline)?;

        let body = message::encode(&msg, self.ctx.registry().dict())?;
        let frame = encode_packet(PacketType::Data, &body)?;
        self.send_frame(frame).await
    }

    /// Queue a Kick packet carrying `reason` as JSON.
    pub(crate) async fn kick(&self, reason: &serde_json::Value) -> Result<(), ServerError> {
        let body = serde_json::to_vec(reason).map_err(SerializeError::from)?;
        let frame = encode_packet(PacketType::Kick, &body)?;
        self.send_frame(frame).await
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), ServerError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ServerError::SessionClosed)
    }

    /// Move to `Closed`, stop the reader and writer, and notify the dispatch
    /// loop. Only the first call has an effect.
    pub async fn close(&self) {
        let prev = self.state.swap(AgentState::Closed as u8, Ordering::AcqRel);
        if prev == AgentState::Closed as u8 {
            return;
        }
        self.cancel.cancel();
        debug!(
            conn_id = self.conn_id,
            peer = %self.peer,
            session_id = self.session.id(),
            uid = self.session.uid(),
            "Session closed"
        );

        if self.ctx.close_tx.send(Arc::clone(&self.session)).await.is_err() {
            debug!(conn_id = self.conn_id, "Dispatch loop gone, close callbacks skipped");
        }
    }

    fn violation(&self, state: AgentState, packet: PacketType) -> ServerError {
        warn!(
            conn_id = self.conn_id,
            peer = %self.peer,
            ?state,
            ?packet,
            "Protocol violation, session will be closed immediately"
        );
        ServerError::ProtocolViolation { state, packet }
    }
}

pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
