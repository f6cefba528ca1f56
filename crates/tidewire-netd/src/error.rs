//! Server error types.

use thiserror::Error;
use tidewire_netproto::{error::ProtoError, packet::PacketType};

use crate::agent::AgentState;
use crate::handler::HandlerKind;
use crate::serialize::SerializeError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("handler: service already defined: {0}")]
    DuplicateService(String),

    #[error("handler: service {0} declares no handlers")]
    NoHandlers(String),

    #[error("handler: {0} declared twice")]
    DuplicateHandler(String),

    #[error("handler: no route aliases left for service {0}")]
    TooManyRoutes(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("unexpected {packet:?} packet in state {state:?}")]
    ProtocolViolation {
        state: AgentState,
        packet: PacketType,
    },

    #[error("{route}: message type does not match {expected:?} handler")]
    KindMismatch { route: String, expected: HandlerKind },

    #[error("session closed")]
    SessionClosed,

    #[error("cannot respond to a notify message")]
    ResponseOnNotify,

    #[error("dispatch loop is not running")]
    DispatchClosed,

    #[error("serialize error: {0}")]
    Serialize(#[from] SerializeError),

    #[error("outbound pipeline: {0}")]
    Pipeline(anyhow::Error),
}
