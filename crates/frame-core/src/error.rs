use msg_envelope::EnvelopeError;
use thiserror::Error;

use crate::frame::EncodeType;

#[derive(Debug, Error)]
/// Errors surfaced by frame construction, mutation, and (de)serialization.
pub enum FrameError {
    #[error("encode level {level} is invalid for {encode:?}")]
    InvalidEncodeLevel { encode: EncodeType, level: i32 },
    #[error("plane index {0} out of range")]
    IndexOutOfRange(usize),
    #[error("pixel buffer is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("frame encode failed: {0}")]
    EncodeFailed(String),
    #[error("frame decode failed: {0}")]
    DecodeFailed(String),
    #[error("unknown encoding type {0:?}")]
    UnknownEncoding(String),
    #[error("envelope carries no frame payload")]
    MissingBlob,
    #[error("frame metadata incomplete: {0}")]
    Envelope(#[from] EnvelopeError),
}
