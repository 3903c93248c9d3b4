use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("ring buffer capacity must be greater than zero, got {0}")]
    InvalidCapacity(usize),
}
