pub mod codec;
pub mod constants;
pub mod dict;
pub mod error;
pub mod handshake;
pub mod message;
pub mod packet;
