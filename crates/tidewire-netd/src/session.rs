//! Client session bound to one connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tidewire_netproto::message::Message;

use crate::agent::Agent;
use crate::error::ServerError;

/// Session id, unique per server.
pub type SessionId = i64;

/// Authenticated client identity associated with a connection.
///
/// Holds only a weak link to its connection, so a session kept by business
/// code does not keep a closed connection alive; operations on it then fail
/// with [`ServerError::SessionClosed`].
pub struct Session {
    id: SessionId,
    uid: AtomicI64,
    authenticated: AtomicBool,
    last_handler_access: Mutex<Instant>,
    agent: Weak<Agent>,
}

impl Session {
    pub(crate) fn new(id: SessionId, agent: Weak<Agent>) -> Self {
        Self {
            id,
            uid: AtomicI64::new(0),
            authenticated: AtomicBool::new(false),
            last_handler_access: Mutex::new(Instant::now()),
            agent,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Bound user id, 0 until [`bind`](Self::bind) is called.
    pub fn uid(&self) -> i64 {
        self.uid.load(Ordering::Relaxed)
    }

    pub fn bind(&self, uid: i64) {
        self.uid.store(uid, Ordering::Relaxed);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub(crate) fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::Release);
    }

    /// When a handler was last routed for this session.
    pub fn last_handler_access(&self) -> Instant {
        *self.last_handler_access.lock()
    }

    pub(crate) fn touch(&self) {
        *self.last_handler_access.lock() = Instant::now();
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.agent.upgrade().map(|a| a.peer())
    }

    /// Send a server-initiated message on `route`.
    pub async fn push<T: Serialize + ?Sized>(&self, route: &str, v: &T) -> Result<(), ServerError> {
        let agent = self.agent()?;
        let data = agent.context().serializer().marshal(v)?;
        agent.send(Message::push(route, data)).await
    }

    /// Reply to the most recently dispatched request of this connection.
    pub async fn response<T: Serialize + ?Sized>(&self, v: &T) -> Result<(), ServerError> {
        let mid = self.agent()?.last_mid();
        self.response_mid(mid, v).await
    }

    /// Reply to request `mid`.
    pub async fn response_mid<T: Serialize + ?Sized>(
        &self,
        mid: u64,
        v: &T,
    ) -> Result<(), ServerError> {
        if mid == 0 {
            return Err(ServerError::ResponseOnNotify);
        }
        let agent = self.agent()?;
        let data = agent.context().serializer().marshal(v)?;
        agent.send(Message::response(mid, data)).await
    }

    /// Send a Kick packet carrying `reason`, then close the connection.
    pub async fn kick(&self, reason: &serde_json::Value) -> Result<(), ServerError> {
        let agent = self.agent()?;
        let sent = agent.kick(reason).await;
        agent.close().await;
        sent
    }

    pub async fn close(&self) {
        if let Some(agent) = self.agent.upgrade() {
            agent.close().await;
        }
    }

    fn agent(&self) -> Result<Arc<Agent>, ServerError> {
        self.agent.upgrade().ok_or(ServerError::SessionClosed)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("uid", &self.uid())
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

/// Reply handle given to request handlers, bound to one request id.
#[derive(Clone)]
pub struct Responder {
    session: Arc<Session>,
    mid: u64,
}

impl Responder {
    pub(crate) fn new(session: Arc<Session>, mid: u64) -> Self {
        Self { session, mid }
    }

    pub fn mid(&self) -> u64 {
        self.mid
    }

    pub async fn respond<T: Serialize + ?Sized>(&self, v: &T) -> Result<(), ServerError> {
        self.session.response_mid(self.mid, v).await
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("session", &self.session.id())
            .field("mid", &self.mid)
            .finish()
    }
}
