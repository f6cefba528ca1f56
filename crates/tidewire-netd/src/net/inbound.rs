/// Connection identifier, unique within one server.
pub type ConnId = u64;

/// How a connection's bytes are carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    WebSocket,
}

impl TransportKind {
    /// Pick the transport from the first bytes a client sent.
    pub fn sniff(prefix: &[u8]) -> Self {
        if prefix.starts_with(b"GET ") {
            Self::WebSocket
        } else {
            Self::Tcp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_websocket_upgrade() {
        assert_eq!(TransportKind::sniff(b"GET / HTTP/1.1"), TransportKind::WebSocket);
        assert_eq!(TransportKind::sniff(&[1, 0, 0, 2]), TransportKind::Tcp);
        assert_eq!(TransportKind::sniff(b"GE"), TransportKind::Tcp);
    }
}
