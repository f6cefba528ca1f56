use bytes::Bytes;
use strum::FromRepr;

/// Packet type tag, the first byte of every frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum PacketType {
    /// Client → server handshake request; server → client handshake response.
    Handshake = 0x01,
    /// Client acknowledges the handshake response.
    HandshakeAck = 0x02,
    /// Keep-alive in both directions.
    Heartbeat = 0x03,
    /// Carries one encoded [`Message`](crate::message::Message).
    Data = 0x04,
    /// Server → client notice that the connection is being terminated.
    Kick = 0x05,
}

/// Borrowed view into a decoded frame. The body points into the input buffer.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    pub kind: PacketType,
    pub body: &'a [u8],
}

impl<'a> PacketView<'a> {
    pub fn new(kind: PacketType, body: &'a [u8]) -> Self {
        Self { kind, body }
    }

    /// Detach the body from the input buffer.
    pub fn to_owned(&self) -> Packet {
        Packet {
            kind: self.kind,
            data: Bytes::copy_from_slice(self.body),
        }
    }
}

/// A decoded packet that owns its body bytes.
/// This is safe to move across tasks/channels.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketType,
    pub data: Bytes,
}

impl Packet {
    pub fn new(kind: PacketType, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }
}
