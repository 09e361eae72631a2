/// Errors that can be returned by forest operations.
///
/// The core never recovers from any of these; they surface to the caller and
/// the structure that reported them is left unchanged.
#[derive(Debug, PartialEq)]
pub enum ForestError {
    /// A point's length does not match the dimensions of the structure.
    InvalidDimension { expected: usize, actual: usize },

    /// A NaN coordinate reached an insertion path.
    InvalidPoint { msg: &'static str },

    /// The point store is full and dynamic resizing is disabled.
    CapacityExceeded { capacity: usize },

    /// Delete of a point that is not present in the tree.
    PointNotFound,

    /// Delete of a sequence index that is not present at the matching leaf.
    SequenceNotFound,

    /// Traversal of a tree with no points.
    EmptyTree,

    /// The state mapper saw a precision tag it does not support.
    PrecisionMismatch { found: String },

    /// A structural operation observed an inconsistent bounding-box cache.
    /// Indicates programmer error, not recoverable data corruption.
    CacheState { msg: &'static str },

    /// Decoding a persisted state failed (truncated or corrupt bytes).
    MalformedState { msg: &'static str },

    /// Catch-all for violated call preconditions.
    InvalidArgument { msg: &'static str },
}

impl std::fmt::Display for ForestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidDimension { expected, actual } => {
                write!(f, "invalid dimension: expected {expected}, got {actual}")
            }
            Self::InvalidPoint { msg } => write!(f, "invalid point: {msg}"),
            Self::CapacityExceeded { capacity } => {
                write!(f, "point store capacity {capacity} exceeded")
            }
            Self::PointNotFound => write!(f, "point not found"),
            Self::SequenceNotFound => write!(f, "sequence index not found"),
            Self::EmptyTree => write!(f, "traversal of an empty tree"),
            Self::PrecisionMismatch { found } => {
                write!(f, "unsupported precision tag {found:?}")
            }
            Self::CacheState { msg } => write!(f, "cache state violation: {msg}"),
            Self::MalformedState { msg } => write!(f, "malformed state: {msg}"),
            Self::InvalidArgument { msg } => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for ForestError {}
