//! Application message envelope carried inside `Data` packets.
//!
//! Layout:
//! - flag byte: `type << 1 | route_compressed`
//! - message id as LEB128 varint (Request / Response only)
//! - route (Request / Notify / Push only): `u16 BE` alias when compressed,
//!   otherwise `u8 len` followed by the UTF-8 route
//! - remaining bytes are the payload

use bytes::{BufMut, Bytes, BytesMut};
use strum::FromRepr;

use crate::{
    constants::{MAX_ROUTE_LEN, MSG_TYPE_MASK, ROUTE_COMPRESS_MASK},
    dict::RouteDict,
    error::ProtoError,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum MessageType {
    Request = 0x00,
    Notify = 0x01,
    Response = 0x02,
    Push = 0x03,
}

impl MessageType {
    /// Whether messages of this type carry a route.
    pub const fn is_routable(self) -> bool {
        matches!(self, Self::Request | Self::Notify | Self::Push)
    }

    /// Whether messages of this type carry an id.
    pub const fn has_id(self) -> bool {
        matches!(self, Self::Request | Self::Response)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub id: u64,
    pub route: String,
    pub data: Bytes,
}

impl Message {
    pub fn request(id: u64, route: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageType::Request,
            id,
            route: route.into(),
            data: data.into(),
        }
    }

    pub fn notify(route: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageType::Notify,
            id: 0,
            route: route.into(),
            data: data.into(),
        }
    }

    pub fn response(id: u64, data: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageType::Response,
            id,
            route: String::new(),
            data: data.into(),
        }
    }

    pub fn push(route: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageType::Push,
            id: 0,
            route: route.into(),
            data: data.into(),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} id={} route={} len={}",
            self.kind,
            self.id,
            self.route,
            self.data.len()
        )
    }
}

/// Encode `msg`, compressing the route when `dict` knows it.
pub fn encode(msg: &Message, dict: &RouteDict) -> Result<Bytes, ProtoError> {
    let mut out = BytesMut::with_capacity(16 + msg.route.len() + msg.data.len());
    let mut flag = (msg.kind as u8) << 1;

    let code = if msg.kind.is_routable() {
        dict.code(&msg.route)
    } else {
        None
    };
    if code.is_some() {
        flag |= ROUTE_COMPRESS_MASK;
    }
    out.put_u8(flag);

    if msg.kind.has_id() {
        put_varint(&mut out, msg.id);
    }

    if msg.kind.is_routable() {
        match code {
            Some(code) => out.put_u16(code),
            None => {
                if msg.route.len() > MAX_ROUTE_LEN {
                    return Err(ProtoError::RouteTooLong(msg.route.len()));
                }
                out.put_u8(msg.route.len() as u8);
                out.put_slice(msg.route.as_bytes());
            }
        }
    }

    out.put_slice(&msg.data);
    Ok(out.freeze())
}

/// Decode a message. The payload is a zero-copy slice of `data`.
pub fn decode(data: &Bytes, dict: &RouteDict) -> Result<Message, ProtoError> {
    let Some(&flag) = data.first() else {
        return Err(ProtoError::InvalidMessage("empty message"));
    };
    let raw_type = (flag >> 1) & MSG_TYPE_MASK;
    let kind = MessageType::from_repr(raw_type).ok_or(ProtoError::WrongMessageType(raw_type))?;
    let mut offset = 1usize;

    let mut id = 0u64;
    if kind.has_id() {
        let (value, used) = get_varint(&data[offset..])?;
        id = value;
        offset += used;
    }

    let mut route = String::new();
    if kind.is_routable() {
        if flag & ROUTE_COMPRESS_MASK != 0 {
            let bytes = data
                .get(offset..offset + 2)
                .ok_or(ProtoError::InvalidMessage("truncated route code"))?;
            let code = u16::from_be_bytes([bytes[0], bytes[1]]);
            route = dict
                .route(code)
                .ok_or(ProtoError::RouteInfoNotFound(code))?
                .to_owned();
            offset += 2;
        } else {
            let len = *data
                .get(offset)
                .ok_or(ProtoError::InvalidMessage("missing route"))? as usize;
            offset += 1;
            let bytes = data
                .get(offset..offset + len)
                .ok_or(ProtoError::InvalidMessage("truncated route"))?;
            route = std::str::from_utf8(bytes)
                .map_err(|_| ProtoError::InvalidMessage("route is not utf-8"))?
                .to_owned();
            offset += len;
        }
    }

    Ok(Message {
        kind,
        id,
        route,
        data: data.slice(offset..),
    })
}

fn put_varint(out: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.put_u8(byte);
            return;
        }
        out.put_u8(byte | 0x80);
    }
}

fn get_varint(buf: &[u8]) -> Result<(u64, usize), ProtoError> {
    let mut value = 0u64;
    for (i, &b) in buf.iter().enumerate() {
        let shift = 7 * i as u32;
        if shift >= u64::BITS {
            return Err(ProtoError::InvalidMessage("message id overflow"));
        }
        value |= u64::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(ProtoError::InvalidMessage("truncated message id"))
}
