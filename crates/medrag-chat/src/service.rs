//! Chat service: the entry point for front ends.
//!
//! Validates input, serializes turns per session, and records feedback.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use medrag_core::config::{ChatConfig, MemoryConfig};
use medrag_core::{FeedbackRecord, SessionId, Turn};
use medrag_feedback::FeedbackSink;

use crate::error::ChatError;
use crate::memory::{MemoryView, SessionStore};
use crate::orchestrator::{Orchestrator, TurnOutcome};

/// Listing entry for one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub turn_count: usize,
}

/// Coordinates sessions, the orchestrator and the feedback sink.
pub struct ChatService {
    orchestrator: Orchestrator,
    sessions: SessionStore,
    feedback: Arc<dyn FeedbackSink>,
    max_message_length: usize,
}

impl ChatService {
    pub fn new(
        orchestrator: Orchestrator,
        feedback: Arc<dyn FeedbackSink>,
        memory: MemoryConfig,
        chat: &ChatConfig,
    ) -> Self {
        Self {
            orchestrator,
            sessions: SessionStore::new(memory),
            feedback,
            max_message_length: chat.max_message_length,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Answer a question in the user's session, creating it on first use.
    ///
    /// Turns for the same session run one at a time; different sessions run
    /// independently.
    pub async fn ask(&self, session_id: &SessionId, message: &str) -> Result<TurnOutcome, ChatError> {
        let question = message.trim();
        if question.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if question.chars().count() > self.max_message_length {
            return Err(ChatError::MessageTooLong(self.max_message_length));
        }

        let handle = self.sessions.get_or_create(session_id);
        let mut session = handle.lock().await;
        Ok(self.orchestrator.run_turn(&mut session, question).await)
    }

    /// Record the user's verdict on one answered turn.
    ///
    /// At most one verdict per turn. The turn is marked only after the sink
    /// accepted the record, so a failed write can be retried.
    pub async fn submit_feedback(
        &self,
        session_id: &SessionId,
        turn_index: usize,
        helpful: bool,
    ) -> Result<FeedbackRecord, ChatError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| ChatError::SessionNotFound(session_id.clone()))?;
        let mut session = handle.lock().await;

        let turn = session
            .turn(turn_index)
            .ok_or_else(|| ChatError::TurnNotFound {
                session: session_id.clone(),
                turn: turn_index,
            })?;
        if turn.feedback.is_some() {
            return Err(ChatError::FeedbackAlreadyRecorded {
                session: session_id.clone(),
                turn: turn_index,
            });
        }

        let record = FeedbackRecord::for_turn(session_id, turn, helpful);
        if let Err(e) = self.feedback.record(&record).await {
            error!(session = %session_id, turn = turn_index, error = %e, "Feedback not recorded");
            return Err(e.into());
        }

        if let Some(turn) = session.turn_mut(turn_index) {
            turn.feedback = Some(helpful);
        }
        info!(session = %session_id, turn = turn_index, helpful, "Feedback recorded");
        Ok(record)
    }

    /// Short-term history of a session, oldest first.
    pub async fn history(&self, session_id: &SessionId) -> Result<Vec<Turn>, ChatError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| ChatError::SessionNotFound(session_id.clone()))?;
        let session = handle.lock().await;
        Ok(session.turns().cloned().collect())
    }

    /// Memory snapshot of a session: recent turns and long-term summary.
    pub async fn memory(&self, session_id: &SessionId) -> Result<MemoryView, ChatError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| ChatError::SessionNotFound(session_id.clone()))?;
        let session = handle.lock().await;
        Ok(session.view())
    }

    /// All live sessions, sorted by id.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut out = Vec::new();
        for (id, handle) in self.sessions.handles() {
            let session = handle.lock().await;
            out.push(SessionSummary {
                id,
                created_at: session.created_at(),
                last_active_at: session.last_active_at(),
                turn_count: session.turn_count(),
            });
        }
        out
    }

    pub fn delete_session(&self, session_id: &SessionId) -> Result<(), ChatError> {
        if self.sessions.remove(session_id) {
            info!(session = %session_id, "Session deleted");
            Ok(())
        } else {
            Err(ChatError::SessionNotFound(session_id.clone()))
        }
    }
}
