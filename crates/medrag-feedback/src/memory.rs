//! In-process feedback sink.
//!
//! Used when no log path is configured and by tests that assert on what was
//! recorded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use medrag_core::FeedbackRecord;

use crate::{FeedbackError, FeedbackSink};

/// Keeps records in memory for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryFeedbackSink {
    records: Mutex<Vec<FeedbackRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryFeedbackSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of everything recorded so far, in write order.
    pub fn records(&self) -> Vec<FeedbackRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FeedbackSink for MemoryFeedbackSink {
    async fn record(&self, record: &FeedbackRecord) -> Result<(), FeedbackError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FeedbackError::WriteFailed("sink is failing".into()));
        }
        self.records
            .lock()
            .map_err(|e| FeedbackError::WriteFailed(format!("lock poisoned: {}", e)))?
            .push(record.clone());
        Ok(())
    }
}
