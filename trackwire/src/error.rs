use thiserror::Error;

/// Codec error type
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer ends before the frame does; caller should read more bytes
    #[error("truncated frame: need {needed} more bytes")]
    Truncated { needed: usize },

    /// Stored checksum does not match the computed one
    #[error("checksum mismatch: got {got:#06x}, computed {computed:#06x}")]
    Checksum { got: u16, computed: u16 },

    /// Frame structure violates the protocol
    #[error("framing error: {0}")]
    Framing(String),

    /// Field value cannot be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Command alias not supported by this codec
    #[error("command not supported: {0}")]
    UnsupportedCommand(String),

    /// Codec configuration problem (bad report format, missing setting)
    #[error("codec configuration error: {0}")]
    Config(String),
}

/// Codec result type
pub type Result<T> = std::result::Result<T, CodecError>;

impl CodecError {
    pub fn framing(msg: impl Into<String>) -> Self {
        CodecError::Framing(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        CodecError::Decode(msg.into())
    }

    /// True when the error means "wait for the rest of the frame"
    pub fn is_truncated(&self) -> bool {
        matches!(self, CodecError::Truncated { .. })
    }
}
