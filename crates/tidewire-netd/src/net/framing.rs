use bytes::{Buf, BytesMut};
use tidewire_netproto::codec::try_decode_packets;
use tidewire_netproto::error::ProtoError;
use tidewire_netproto::packet::Packet;

/// Receive buffer for one connection.
///
/// Socket reads append to the buffer; [`drain_packets`](Self::drain_packets)
/// decodes every complete packet and keeps the partial tail for the next read.
pub struct PacketFramer {
    buf: BytesMut,
}

impl PacketFramer {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(initial_capacity),
        }
    }

    /// Buffer to read into, e.g. `socket.read_buf(framer.buf_mut())`.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode as many packets as the buffer holds.
    ///
    /// Packet bodies are copied out, so the returned packets do not keep the
    /// receive buffer alive.
    pub fn drain_packets(&mut self) -> Result<Vec<Packet>, ProtoError> {
        let (views, consumed) = try_decode_packets(&self.buf)?;
        let packets = views.iter().map(|v| v.to_owned()).collect();
        self.buf.advance(consumed);
        Ok(packets)
    }
}
