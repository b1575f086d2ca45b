use thiserror::Error;

/// Session-level failures. Per-node parameter errors are absorbed where
/// they happen (logged and skipped) and never surface through this type.
#[derive(Debug, Error)]
pub enum IprError {
    #[error("Unable to allocate session resource: {0}")]
    Resource(String),
    #[error("Control channel closed")]
    ChannelClosed,
    #[error("Session already stopped")]
    SessionStopped,
    #[error("Renderer failure: {0}")]
    RenderFatal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Message codec error: {0}")]
    Codec(#[from] Box<bincode::ErrorKind>),
}
