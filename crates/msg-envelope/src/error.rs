use thiserror::Error;

#[derive(Debug, Error)]
/// Errors raised by envelope document operations.
pub enum EnvelopeError {
    #[error("key {0:?} is already bound; remove it before replacing")]
    KeyExists(String),
    #[error("key {0:?} not found")]
    NotFound(String),
    #[error("value for {key:?} is not of type {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
    },
    #[error("blob index {0} out of range")]
    BlobIndex(usize),
}
