//! Game-server connection and dispatch core.
//!
//! Accepts client connections, runs each through the handshake state machine,
//! routes data messages to registered component handlers and executes them
//! from a single dispatch loop that also drives timers and session teardown.

pub mod agent;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod net;
pub mod pcall;
pub mod pipeline;
pub mod serialize;
pub mod server;
pub mod session;
pub mod timer;

pub use config::ServerConfig;
pub use context::ServerContext;
pub use error::ServerError;
pub use handler::{Component, HandlerResult, HandlerSet, ServiceOptions};
pub use server::{Server, ServerBuilder};
pub use session::{Responder, Session};
