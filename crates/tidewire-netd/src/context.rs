//! State shared by every connection task and the dispatch loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use tidewire_netproto::{
    codec::encode_packet, dict::RouteDict, handshake::HandshakeRequest,
    handshake::HandshakeResponse, packet::PacketType,
};
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::dispatch::WorkItem;
use crate::error::ServerError;
use crate::handler::registry::HandlerRegistry;
use crate::net::inbound::ConnId;
use crate::pipeline::Pipeline;
use crate::serialize::Serializer;
use crate::session::{Session, SessionId};
use crate::timer::TimerManager;

/// Handshake authorization hook. `None` accepts the client, `Some(reason)`
/// rejects it with `reason` sent in a Kick packet.
///
/// The request is `None` when the handshake body could not be parsed.
pub type AuthFn = Arc<
    dyn Fn(&Session, Option<&HandshakeRequest>) -> Option<serde_json::Value> + Send + Sync,
>;

/// Runs on the dispatch loop after a session's connection has closed.
pub type SessionCallback = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

/// Frames that are identical for every connection, encoded once at startup.
#[derive(Debug, Clone)]
pub struct Frames {
    pub handshake_response: Bytes,
    pub heartbeat: Bytes,
}

impl Frames {
    pub(crate) fn encode(config: &ServerConfig, dict: &RouteDict) -> Result<Self, ServerError> {
        let body = HandshakeResponse::ok(
            config.heartbeat.as_secs(),
            dict,
            &config.version,
            &config.handshake_payload,
        )
        .to_json()?;
        Ok(Self {
            handshake_response: encode_packet(PacketType::Handshake, &body)?,
            heartbeat: encode_packet(PacketType::Heartbeat, &[])?,
        })
    }
}

pub struct ServerContext {
    config: ServerConfig,
    registry: HandlerRegistry,
    serializer: Serializer,
    pipeline: Pipeline,
    auth: Option<AuthFn>,
    frames: Frames,
    pub(crate) work_tx: mpsc::Sender<WorkItem>,
    pub(crate) close_tx: mpsc::Sender<Arc<Session>>,
    callbacks: RwLock<Vec<SessionCallback>>,
    timers: TimerManager,
    next_session_id: AtomicI64,
    next_conn_id: AtomicU64,
}

pub(crate) struct ContextParts {
    pub(crate) config: ServerConfig,
    pub(crate) registry: HandlerRegistry,
    pub(crate) serializer: Serializer,
    pub(crate) pipeline: Pipeline,
    pub(crate) auth: Option<AuthFn>,
    pub(crate) callbacks: Vec<SessionCallback>,
    pub(crate) work_tx: mpsc::Sender<WorkItem>,
    pub(crate) close_tx: mpsc::Sender<Arc<Session>>,
    pub(crate) timers: TimerManager,
}

impl ServerContext {
    pub(crate) fn new(parts: ContextParts) -> Result<Self, ServerError> {
        let frames = Frames::encode(&parts.config, parts.registry.dict())?;
        Ok(Self {
            config: parts.config,
            registry: parts.registry,
            serializer: parts.serializer,
            pipeline: parts.pipeline,
            auth: parts.auth,
            frames,
            work_tx: parts.work_tx,
            close_tx: parts.close_tx,
            callbacks: RwLock::new(parts.callbacks),
            timers: parts.timers,
            next_session_id: AtomicI64::new(1),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub(crate) fn auth(&self) -> Option<&AuthFn> {
        self.auth.as_ref()
    }

    pub fn frames(&self) -> &Frames {
        &self.frames
    }

    /// Timer service driven by the dispatch loop.
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Register a callback for closed sessions. Components usually do this
    /// from [`Component::init`](crate::handler::Component::init).
    pub fn on_session_closed<F>(&self, f: F)
    where
        F: Fn(&Arc<Session>) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(f));
    }

    /// Snapshot of the close callbacks, so none run under the lock.
    pub(crate) fn session_callbacks(&self) -> Vec<SessionCallback> {
        self.callbacks.read().clone()
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("config", &self.config)
            .field("handlers", &self.registry.len())
            .field("serializer", &self.serializer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ServerConfig;
    use crate::server::ServerBuilder;
    use crate::test_support::parts;

    #[test]
    fn id_counters_belong_to_each_server() {
        let (a, _da) = parts(ServerBuilder::new(ServerConfig::default()));
        let (b, _db) = parts(ServerBuilder::new(ServerConfig::default()));

        assert_eq!(a.next_conn_id(), 1);
        assert_eq!(a.next_conn_id(), 2);
        assert_eq!(b.next_conn_id(), 1);
        assert_eq!(a.next_session_id(), 1);
        assert_eq!(b.next_session_id(), 1);
    }
}
