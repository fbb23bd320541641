//! Compilation errors, including the bailout signal.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The function uses a construct this tier does not lower. The
    /// compilation is abandoned; the driver chooses a fallback.
    #[error("bailout in `{function}`: {reason}")]
    Bailout { function: String, reason: String },

    /// The flow graph breaks a contract the backend relies on.
    #[error("invalid flow graph for `{function}`: {message}")]
    InvalidGraph { function: String, message: String },

    #[error("label error: {0}")]
    Label(String),

    #[error("invalid pc descriptors: {0}")]
    Descriptors(String),
}

impl CompileError {
    pub fn is_bailout(&self) -> bool {
        matches!(self, CompileError::Bailout { .. })
    }

    /// Reason of a bailout.
    pub fn bailout_reason(&self) -> Option<&str> {
        match self {
            CompileError::Bailout { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
