//! JSON-lines feedback sink.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use medrag_core::FeedbackRecord;

use crate::{FeedbackError, FeedbackSink};

/// Appends one JSON object per line to a file.
///
/// Each record is serialized up front and written with a single call while
/// holding the sink's lock, so lines from concurrent sessions never interleave.
#[derive(Debug)]
pub struct JsonlFeedbackSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlFeedbackSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FeedbackSink for JsonlFeedbackSink {
    async fn record(&self, record: &FeedbackRecord) -> Result<(), FeedbackError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(
            session = %record.session_id,
            turn = record.turn_index,
            helpful = record.helpful,
            "Feedback appended"
        );
        Ok(())
    }
}
