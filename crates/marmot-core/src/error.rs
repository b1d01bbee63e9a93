use crate::memory::MemorySpace;
use crate::shape::Shape;

/// All errors that can occur within marmot.
///
/// Graph construction, shape inference, buffer allocation and checkpoint
/// loading all report through this one enum. None of them are retried: a
/// malformed graph or an exhausted memory space stays that way.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or inconsistent graph description. Raised while building;
    /// the graph is unusable.
    #[error("config error: {0}")]
    Config(String),

    /// Shape mismatch between two tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// An operator rejected the shape of one of its inputs.
    #[error("shape error: {0}")]
    Shape(String),

    /// Element count mismatch when filling a tensor from a slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Allocation failed in the given memory space.
    #[error("failed to allocate {bytes} bytes in {space} memory")]
    Allocation { space: MemorySpace, bytes: usize },

    /// A device accessor was used on a host-only buffer.
    #[error("no accelerator device attached to this buffer")]
    NoDevice,

    /// An accessor was called in a head state it does not support.
    #[error("invalid buffer state: {0}")]
    InvalidState(String),

    /// Execution range outside the node list.
    #[error("invalid node range [{start}, {end}] for a graph of {len} nodes")]
    InvalidRange { start: usize, end: usize, len: usize },

    /// A pretrained parameter does not fit the target graph.
    #[error("cannot load '{name}': {reason}")]
    LoadMismatch { name: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Create a graph configuration error.
    pub fn config(s: impl Into<String>) -> Self {
        Error::Config(s.into())
    }

    /// Create a shape error.
    pub fn shape(s: impl Into<String>) -> Self {
        Error::Shape(s.into())
    }
}

/// Convenience Result type used throughout marmot.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted [`Error::Msg`].
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

/// Early return with a formatted [`Error::Config`].
#[macro_export]
macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Config(format!($($arg)*)))
    };
}
