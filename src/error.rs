//! Error types for kernel inspection.

use thiserror::Error;

/// Errors surfaced by the connector, handlers and coordinator.
///
/// None of these tear down a handler or the coordinator; they are reported to
/// whichever caller (or event subscriber) owns the failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InspectorError {
    /// No probe bundle is registered for the kernel language.
    #[error("language {0} not supported yet")]
    UnsupportedLanguage(String),

    /// The probe bundle's init script failed on the kernel.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// The kernel reported an error while evaluating a probe command.
    #[error("kernel error on {command} call: {message}")]
    KernelEvaluationError { command: String, message: String },

    /// The kernel's reply could not be decoded into the expected schema.
    #[error("decode error: {0}")]
    DecodeError(String),

    /// The handler has already been disposed.
    #[error("handler disposed")]
    HandlerDisposed,

    /// No kernel is attached, or the session itself failed.
    #[error("kernel unavailable: {0}")]
    KernelUnavailable(String),
}

impl From<serde_json::Error> for InspectorError {
    fn from(err: serde_json::Error) -> Self {
        Self::DecodeError(err.to_string())
    }
}

/// Result type for inspection operations.
pub type Result<T> = std::result::Result<T, InspectorError>;
