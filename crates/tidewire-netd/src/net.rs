//! Transport layer: accept loop, per-connection reader and writer tasks.

pub mod framing;
pub mod inbound;
pub mod outbound;
pub mod stream_adapter;
pub mod tcp;
