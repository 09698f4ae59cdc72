//! Plain `Default`-deriving configuration struct (no config-file crate —
//! fields are overridden directly, typically from a `clap::Parser` struct
//! in a binary crate).

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_address: String,
    pub dealer_port: u16,
    pub sub_port: u16,
    pub room_id: String,
    pub send_rate_hz: f64,
    pub enable_discovery: bool,
    pub beacon_port: u16,
    pub discovery_timeout_secs: f64,
    pub reconnect_delay_secs: f64,
    pub rpc_limit: u32,
    pub rpc_rate_window_secs: f64,
    pub rpc_pending_max: usize,
    pub rpc_ttl_secs: f64,
    pub rpc_flush_per_frame: usize,
    pub nv_debounce_ms: u64,
    pub heartbeat_interval_secs: f64,
    /// Ring capacity of each per-part pose channel, i.e. how many snapshots
    /// are kept for interpolation/extrapolation lookups.
    pub snapshot_buffer_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_address: "localhost".to_string(),
            dealer_port: 5555,
            sub_port: 5556,
            room_id: "default_room".to_string(),
            send_rate_hz: 10.0,
            enable_discovery: true,
            beacon_port: 9999,
            discovery_timeout_secs: 5.0,
            reconnect_delay_secs: 10.0,
            rpc_limit: 30,
            rpc_rate_window_secs: 1.0,
            rpc_pending_max: 100,
            rpc_ttl_secs: 5.0,
            rpc_flush_per_frame: 10,
            nv_debounce_ms: 100,
            heartbeat_interval_secs: 1.0,
            snapshot_buffer_capacity: 16,
        }
    }
}

impl SessionConfig {
    pub fn nv_debounce_secs(&self) -> f64 {
        self.nv_debounce_ms as f64 / 1000.0
    }
}
