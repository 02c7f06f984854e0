#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to set up the raw socket: {0}")]
    Setup(#[from] std::io::Error),
    #[error("source address {addr} is already in use by another connection")]
    SrcInUse { addr: String },
}
