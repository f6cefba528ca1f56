use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    constants::{HEADER_LEN, MAX_PACKET_SIZE},
    error::ProtoError,
    packet::{PacketType, PacketView},
};

/// Encode one packet into a frame: `[type][u24 len BE][body]`.
pub fn encode_packet(kind: PacketType, body: &[u8]) -> Result<Bytes, ProtoError> {
    if body.len() > MAX_PACKET_SIZE {
        return Err(ProtoError::PacketSizeExceeded(body.len()));
    }

    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    out.put_u8(kind as u8);
    let len = body.len() as u32;
    out.put_slice(&len.to_be_bytes()[1..]);
    out.put_slice(body);
    Ok(out.freeze())
}

/// Decode as many complete frames as `in_buf` holds.
///
/// Returns the decoded views and the number of bytes they consumed. A trailing
/// partial frame is left untouched so the caller can retry after the next read.
pub fn try_decode_packets(in_buf: &[u8]) -> Result<(Vec<PacketView<'_>>, usize), ProtoError> {
    let mut packets = Vec::new();
    let mut offset = 0usize;

    loop {
        let rest = &in_buf[offset..];
        if rest.len() < HEADER_LEN {
            break;
        }

        let kind = PacketType::from_repr(rest[0]).ok_or(ProtoError::WrongPacketType(rest[0]))?;
        let body_len = u32::from_be_bytes([0, rest[1], rest[2], rest[3]]) as usize;
        if body_len > MAX_PACKET_SIZE {
            return Err(ProtoError::PacketSizeExceeded(body_len));
        }

        let total_needed = HEADER_LEN + body_len;
        if rest.len() < total_needed {
            break;
        }

        packets.push(PacketView::new(kind, &rest[HEADER_LEN..total_needed]));
        offset += total_needed;
    }

    Ok((packets, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_carries_type_and_big_endian_length() {
        let frame = encode_packet(PacketType::Data, &[0xAB; 300]).unwrap();
        assert_eq!(frame[0], 0x04);
        assert_eq!(&frame[1..4], &[0x00, 0x01, 0x2C]);
        assert_eq!(frame.len(), HEADER_LEN + 300);
    }

    #[test]
    fn empty_body_is_a_bare_header() {
        let frame = encode_packet(PacketType::Heartbeat, &[]).unwrap();
        assert_eq!(&frame[..], &[0x03, 0, 0, 0]);
    }

    #[test]
    fn partial_frame_is_left_for_next_read() {
        let first = encode_packet(PacketType::HandshakeAck, &[]).unwrap();
        let second = encode_packet(PacketType::Data, b"hello").unwrap();

        let mut buf = first.to_vec();
        buf.extend_from_slice(&second[..6]);

        let (packets, consumed) = try_decode_packets(&buf).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind, PacketType::HandshakeAck);
        assert_eq!(consumed, first.len());

        buf.extend_from_slice(&second[6..]);
        let (packets, consumed) = try_decode_packets(&buf[consumed..]).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].body, b"hello");
        assert_eq!(consumed, second.len());
    }

    #[test]
    fn unknown_packet_type_is_rejected() {
        let err = try_decode_packets(&[0x09, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtoError::WrongPacketType(0x09)));
    }

    #[test]
    fn oversize_body_is_rejected_before_buffering() {
        let len = (MAX_PACKET_SIZE + 1) as u32;
        let b = len.to_be_bytes();
        let err = try_decode_packets(&[0x04, b[1], b[2], b[3]]).unwrap_err();
        assert!(matches!(err, ProtoError::PacketSizeExceeded(_)));

        let err = encode_packet(PacketType::Data, &vec![0; MAX_PACKET_SIZE + 1]).unwrap_err();
        assert!(matches!(err, ProtoError::PacketSizeExceeded(_)));
    }
}
