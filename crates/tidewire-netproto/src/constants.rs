/// Packet header length in bytes (wire format).
///
/// Every packet is framed as `[u8 type][u24 body_len_be][body]`.
pub const HEADER_LEN: usize = 4;

/// Maximum body size of a single packet, in bytes.
/// This limit is enforced on both encode and decode to avoid unbounded allocations.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Status code carried by a successful handshake response.
pub const HANDSHAKE_OK: u16 = 200;

/// Bit set in the message flag byte when the route is sent as a numeric alias.
pub const ROUTE_COMPRESS_MASK: u8 = 0x01;

/// Mask applied to `flag >> 1` to extract the message type.
pub const MSG_TYPE_MASK: u8 = 0x07;

/// Longest route that can be sent uncompressed (length is a single byte).
pub const MAX_ROUTE_LEN: usize = u8::MAX as usize;
