use std::time::Duration;

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interval between server heartbeats. A connection silent for two
    /// intervals is closed.
    pub heartbeat: Duration,
    /// Capacity of the pending-work queue between readers and the dispatch loop.
    pub packet_backlog: usize,
    /// Capacity of each connection's outbound frame queue.
    pub write_backlog: usize,
    /// Bytes reserved per socket read.
    pub read_chunk: usize,
    /// Hard cap on bytes buffered while waiting for a complete packet.
    pub max_buffered: usize,
    /// Period of the cron tick that fires timers and maintenance.
    pub timer_precision: Duration,
    /// Version string sent in the handshake response.
    pub version: String,
    /// Opaque value sent as `payLoad` in the handshake response.
    pub handshake_payload: serde_json::Value,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            packet_backlog: 1024,
            write_backlog: 16,
            read_chunk: 2048,
            max_buffered: 256 * 1024,
            timer_precision: Duration::from_secs(1),
            version: String::new(),
            handshake_payload: serde_json::Value::Null,
        }
    }
}
