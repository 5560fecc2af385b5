/// Convenience result type used throughout `mandelbench`.
pub type MandelResult<T> = Result<T, MandelError>;

/// Top-level error type returned by `mandelbench` APIs.
#[derive(thiserror::Error, Debug)]
pub enum MandelError {
    /// Caller input failed validation (render params, strategy combination, row index).
    #[error("validation error: {0}")]
    Validation(String),

    /// A capability required by the selected strategy is not available.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The cross-thread channel failed or a message could not be decoded.
    #[error("transport error: {0}")]
    Transport(String),

    /// A running job failed inside its kernel or device submission.
    #[error("execution error: {0}")]
    Execution(String),

    /// Opaque underlying error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MandelError {
    /// Build a [`MandelError::Validation`] value.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Build a [`MandelError::Configuration`] value.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Build a [`MandelError::Transport`] value.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Build a [`MandelError::Execution`] value.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }
}
