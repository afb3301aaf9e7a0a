use thiserror::Error;

use crate::layer::Layer;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed slice data at line {line}: {message}")]
    Malformed { line: usize, message: String },
    #[error("No more layers")]
    Exhausted,
}

/// Produces layers sequentially, on demand. Used from the producer thread only.
pub trait GeometrySource: Send {
    fn has_next(&self) -> bool;
    fn read_next(&mut self) -> Result<Layer, SourceError>;
    fn total_count(&self) -> u32;
}
