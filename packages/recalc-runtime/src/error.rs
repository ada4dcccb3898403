//! Runtime error types.

use recalc_core::RecalcError;
use thiserror::Error;

/// Errors surfaced by the bridge service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// The engine rejected the request
    #[error(transparent)]
    Recalc(#[from] RecalcError),

    /// The service stopped before answering
    #[error("Bridge service channel closed")]
    ChannelClosed,

    /// A cascade panicked; its transaction was rolled back
    #[error("Cascade panicked: {0}")]
    TaskPanicked(String),
}

impl RuntimeError {
    /// Returns the engine error, if any.
    pub fn as_recalc(&self) -> Option<&RecalcError> {
        match self {
            RuntimeError::Recalc(e) => Some(e),
            _ => None,
        }
    }
}
