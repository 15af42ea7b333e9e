//! Error types for the chat service.
//!
//! Collaborator failures never surface here: the orchestrator turns them into
//! fallback answers. These errors are about the caller's request.

use medrag_core::SessionId;
use medrag_feedback::FeedbackError;

/// Errors from the chat service.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("message exceeds maximum length of {0} characters")]
    MessageTooLong(usize),
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("turn {turn} not found in session {session}")]
    TurnNotFound { session: SessionId, turn: usize },
    #[error("feedback already recorded for turn {turn} in session {session}")]
    FeedbackAlreadyRecorded { session: SessionId, turn: usize },
    #[error("feedback write failed: {0}")]
    FeedbackWriteFailed(String),
}

impl From<FeedbackError> for ChatError {
    fn from(err: FeedbackError) -> Self {
        match err {
            FeedbackError::WriteFailed(msg) => ChatError::FeedbackWriteFailed(msg),
        }
    }
}
