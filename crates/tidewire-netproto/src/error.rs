use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("wrong packet type {0:#04x}")]
    WrongPacketType(u8),
    #[error("packet size exceeds limit: {0}")]
    PacketSizeExceeded(usize),
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
    #[error("wrong message type {0}")]
    WrongMessageType(u8),
    #[error("route info not found in dictionary: {0}")]
    RouteInfoNotFound(u16),
    #[error("route too long: {0} bytes")]
    RouteTooLong(usize),
    #[error("route dictionary full: {0} aliases in use")]
    RouteDictFull(usize),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
