use crate::device::Device;
use crate::shape::Shape;

/// All errors that can occur within Stoat.
///
/// A single error type across the workspace keeps propagation simple:
/// allocation and device failures, shape/axis validation, reduction
/// degeneracies, and executor-level graph/replica failures all live here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Storage allocation failed (zero-sized shape or invalid device id).
    #[error("allocation failed on {device}: {reason}")]
    Allocation { device: Device, reason: String },

    /// Shape mismatch between two buffers (e.g. add of [2,3] and [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation dispatched on a buffer resident on the wrong device.
    #[error("device mismatch: expected {expected}, got {got}")]
    DeviceMismatch { expected: Device, got: Device },

    /// A reduction axis set contains the same axis twice.
    #[error("duplicate reduction axis {axis}")]
    InvalidAxis { axis: usize },

    /// An axis index is outside `[0, ndim)`.
    #[error("axis {axis} out of range for buffer with {ndim} dimensions")]
    AxisOutOfRange { axis: usize, ndim: usize },

    /// Unbiased variance/std over a group too small for the N-1 estimator.
    #[error("degenerate reduction: unbiased estimator needs group size >= 2, got {group_size}")]
    DegenerateReduction { group_size: usize },

    /// Element count mismatch when creating a buffer or view from data.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// The layer graph failed validation at build time (cycle, unreachable
    /// output, dangling parent index).
    #[error("graph validation failed: {0}")]
    GraphValidation(String),

    /// A replica aborted mid-step. The whole step must be discarded:
    /// gradient sync assumes every replica completed.
    #[error("replica {replica} failed: {reason}")]
    ReplicaFailure { replica: usize, reason: String },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout Stoat.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
