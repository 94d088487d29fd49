use thiserror::Error;

/// Error classification for scheduler and handler failures.
///
/// Handlers catch and classify remote errors themselves; what reaches the
/// scheduler through this type is either a storage fault, a malformed
/// record, or a scheduler bug. None of these propagate to user-facing code.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("unknown action kind: {0}")]
    UnknownAction(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("invalid process record: {0}")]
    InvalidRecord(String),
}

impl ProcessError {
    /// True for the programming-error class: a scheduler bug or a malformed
    /// record, as opposed to an operational storage fault.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            ProcessError::UnknownAction(_)
                | ProcessError::Invariant(_)
                | ProcessError::InvalidRecord(_)
        )
    }
}

impl From<serde_json::Error> for ProcessError {
    fn from(e: serde_json::Error) -> Self {
        ProcessError::InvalidRecord(e.to_string())
    }
}
