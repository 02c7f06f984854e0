/// Tunables for an [`crate::Engine`]. The system has almost no
/// configuration surface; this exists mainly so callers can override the
/// advertised TCP window or TTL without reaching into the wire format
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    pub tcp_window: u16,
    pub ip_ttl: u8,
    pub recv_buffer_len: usize,
    /// Whether to retry a demux miss against the `"src_ip:dst_port"`
    /// fallback key before dropping the packet. Useful when traffic is
    /// redirected (e.g. DNAT) and arrives with a source address that
    /// doesn't match what the connection table was keyed with.
    pub fallback_lookup: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tcp_window: 4096,
            ip_ttl: 64,
            recv_buffer_len: tcpmany_packet::MAX_SIZE,
            fallback_lookup: true,
        }
    }
}
