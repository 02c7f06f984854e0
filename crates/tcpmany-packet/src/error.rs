#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("payload of {len} bytes exceeds the {max}-byte maximum")]
    PayloadOversize { len: usize, max: usize },
    #[error("raw frame of {len} bytes is shorter than the 40-byte IP+TCP header")]
    Truncated { len: usize },
    #[error("ip protocol {proto} is not tcp (6)")]
    NotTcp { proto: u8 },
}
