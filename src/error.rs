use thiserror::Error;

/// Terminal outcomes of an orchestration run other than success.
///
/// `Validation` and `Tool` carry the exact text shown to the user. None of these
/// are faults: the session turns each one into a [`crate::model::RunReport`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Tool(String),

    #[error("The operation was canceled.")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    pub fn validation(message: impl Into<String>) -> Self {
        RunError::Validation(message.into())
    }

    pub fn tool(message: impl Into<String>) -> Self {
        RunError::Tool(message.into())
    }
}
