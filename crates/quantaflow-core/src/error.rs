use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, TensorError>;

/// Error taxonomy for the core and the node layer.
///
/// Everything here is recoverable and propagates to the immediate caller;
/// computation is deterministic, so there is no retry path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    #[error("Shape mismatch in operation '{operation}': expected {expected}, got {got}")]
    ShapeMismatch {
        operation: String,
        expected: String,
        got: String,
    },

    #[error("Invalid argument in operation '{operation}': {reason}")]
    InvalidArgument { operation: String, reason: String },

    #[error("Invalid axis {axis} in operation '{operation}' for tensor with {ndim} dimensions")]
    InvalidAxis {
        operation: String,
        axis: usize,
        ndim: usize,
    },

    #[error("Operation '{operation}' not supported: {reason}")]
    UnsupportedOperation { operation: String, reason: String },

    #[error("Gradient state error in node '{node}': {reason}")]
    GradientState { node: String, reason: String },

    #[error("Operation '{operation}' was cancelled")]
    Cancelled { operation: String },
}

impl TensorError {
    pub fn shape_mismatch(
        operation: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self::ShapeMismatch {
            operation: operation.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }

    pub fn invalid_argument(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_axis(operation: impl Into<String>, axis: usize, ndim: usize) -> Self {
        Self::InvalidAxis {
            operation: operation.into(),
            axis,
            ndim,
        }
    }

    pub fn unsupported_operation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Backward was invoked on a node whose forward cache is empty.
    pub fn backward_before_forward(node: impl Into<String>) -> Self {
        Self::GradientState {
            node: node.into(),
            reason: "backward called before forward".to_string(),
        }
    }

    /// Backward was invoked with inputs that disagree with the cached forward.
    pub fn stale_cache(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::GradientState {
            node: node.into(),
            reason: format!("stale forward cache: {}", reason.into()),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }
}
