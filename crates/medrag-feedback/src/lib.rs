//! Append-only feedback log.
//!
//! The chat service writes one [`FeedbackRecord`] per answered turn. Records
//! are consumed offline for evaluation and never read back by the pipeline.

pub mod jsonl;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use medrag_core::FeedbackRecord;

pub use jsonl::JsonlFeedbackSink;
pub use memory::MemoryFeedbackSink;

/// Errors from a feedback sink.
#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("feedback write failed: {0}")]
    WriteFailed(String),
}

impl From<std::io::Error> for FeedbackError {
    fn from(err: std::io::Error) -> Self {
        FeedbackError::WriteFailed(err.to_string())
    }
}

impl From<serde_json::Error> for FeedbackError {
    fn from(err: serde_json::Error) -> Self {
        FeedbackError::WriteFailed(err.to_string())
    }
}

/// Durable destination for feedback records.
///
/// Implementations must accept concurrent writers from different sessions.
/// Duplicate detection is the caller's job.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn record(&self, record: &FeedbackRecord) -> Result<(), FeedbackError>;
}
