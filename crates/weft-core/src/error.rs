use thiserror::Error;

/// Unified error type for the entire weft workspace.
#[derive(Error, Debug)]
pub enum WeftError {
    // ── Codec errors ───────────────────────────────────────────
    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("compressed frame received but no decompressor is configured")]
    CompressedFrameUnsupported,

    #[error("frame encode error: {0}")]
    FrameEncode(String),

    #[error("frame decode error: {0}")]
    FrameDecode(String),

    // ── Overlay / sidecar errors ───────────────────────────────
    #[error("sidecar did not reach running state within the startup window")]
    StartupTimeout,

    #[error("sidecar startup failed: {0}")]
    StartupError(String),

    #[error("sidecar error: {0}")]
    Sidecar(String),

    // ── Transport errors ───────────────────────────────────────
    #[error("dial to {0} timed out")]
    DialTimeout(String),

    #[error("dial to {device_id} failed: {reason}")]
    DialError { device_id: String, reason: String },

    #[error("connection {0} is not connected")]
    NotConnected(String),

    // ── Mesh errors ────────────────────────────────────────────
    #[error("invalid control payload: {0}")]
    InvalidControlPayload(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, WeftError>;
