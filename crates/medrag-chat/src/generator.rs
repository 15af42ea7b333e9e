//! Grounded answer generation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use medrag_core::{CollaboratorError, GradedDocument, RewrittenQuery};
use medrag_llm::{InferenceModel, InferenceRequest, PromptMessage};

use crate::memory::MemoryView;

/// Produces answer text from the question, its evidence and recent history.
///
/// Called only with a non-empty evidence set.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(
        &self,
        query: &RewrittenQuery,
        evidence: &[GradedDocument],
        memory: &MemoryView,
    ) -> Result<String, CollaboratorError>;
}

const ANSWER_INSTRUCTION: &str = "You answer questions about a medical case study. Answer \
the question using only the context passages below and the chat history, paying most \
attention to the latest question. If the context does not contain the answer, say that the \
case-study documents do not cover it. Do not invent facts.";

/// Answers with the language model from evidence text only.
pub struct GroundedGenerator {
    model: Arc<dyn InferenceModel>,
}

impl GroundedGenerator {
    pub fn new(model: Arc<dyn InferenceModel>) -> Self {
        Self { model }
    }

    /// Prompt: instruction, summary, recent turns oldest first, then the
    /// context passages and the question.
    pub fn build_request(
        query: &RewrittenQuery,
        evidence: &[GradedDocument],
        memory: &MemoryView,
    ) -> InferenceRequest {
        let mut history = Vec::with_capacity(memory.recent_turns().len() * 2 + 1);
        if !memory.summary().is_empty() {
            history.push(PromptMessage::system(format!(
                "Summary of the earlier conversation:\n{}",
                memory.summary()
            )));
        }
        for turn in memory.recent_turns().iter().rev() {
            history.push(PromptMessage::user(turn.rewritten.text.clone()));
            history.push(PromptMessage::assistant(turn.answer.text.clone()));
        }

        let context = evidence
            .iter()
            .enumerate()
            .map(|(i, g)| format!("[{}] {}", i + 1, g.document.text.trim()))
            .collect::<Vec<_>>()
            .join("\n\n");
        let user = format!("Context:\n{}\n\nQuestion: {}", context, query.text);

        InferenceRequest::new(ANSWER_INSTRUCTION, user).with_history(history)
    }
}

#[async_trait]
impl AnswerGenerator for GroundedGenerator {
    async fn generate(
        &self,
        query: &RewrittenQuery,
        evidence: &[GradedDocument],
        memory: &MemoryView,
    ) -> Result<String, CollaboratorError> {
        let request = Self::build_request(query, evidence, memory);
        let text = self.model.infer(&request).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(CollaboratorError::InferenceUnavailable(
                "model returned an empty answer".into(),
            ));
        }
        debug!(
            model = self.model.model_name(),
            evidence = evidence.len(),
            chars = text.len(),
            "Answer generated"
        );
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use medrag_core::{Answer, RetrievedDocument, Topic, Turn};
    use medrag_llm::Role;
    use std::sync::Mutex;

    fn evidence(texts: &[&str]) -> Vec<GradedDocument> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| GradedDocument {
                document: RetrievedDocument::new(format!("c{}", i), *t),
                relevant: true,
                score: 0.9,
            })
            .collect()
    }

    fn prior_turn() -> Turn {
        Turn {
            index: 0,
            question: "What is Repatha?".into(),
            rewritten: RewrittenQuery::unchanged("What is Repatha?"),
            topic: Some(Topic::DrugInformation),
            graded: vec![],
            answer: Answer::generated("A PCSK9 inhibitor.", evidence(&["Repatha..."])),
            timestamp: Utc::now(),
            feedback: None,
        }
    }

    #[test]
    fn test_request_contains_only_evidence_and_question() {
        let req = GroundedGenerator::build_request(
            &RewrittenQuery::unchanged("What are the side effects of Repatha?"),
            &evidence(&["Nasopharyngitis was common.", "Back pain was reported."]),
            &MemoryView::empty(),
        );
        assert_eq!(req.messages.len(), 2);
        let user = req.user_content();
        assert!(user.contains("[1] Nasopharyngitis was common."));
        assert!(user.contains("[2] Back pain was reported."));
        assert!(user.ends_with("Question: What are the side effects of Repatha?"));
    }

    #[test]
    fn test_request_includes_history_in_order() {
        let memory = MemoryView::new(vec![prior_turn()], "#0 [Overview] Q: hi | A: hello");
        let req = GroundedGenerator::build_request(
            &RewrittenQuery::unchanged("How is Repatha dosed?"),
            &evidence(&["140 mg every 2 weeks"]),
            &memory,
        );
        let roles: Vec<Role> = req.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::System, Role::User, Role::Assistant, Role::User]
        );
        assert!(req.messages[1].content.contains("Q: hi"));
        assert_eq!(req.messages[2].content, "What is Repatha?");
        assert_eq!(req.messages[3].content, "A PCSK9 inhibitor.");
    }

    struct Recording {
        reply: String,
        seen: Mutex<Vec<InferenceRequest>>,
    }

    #[async_trait]
    impl InferenceModel for Recording {
        async fn infer(&self, request: &InferenceRequest) -> Result<String, CollaboratorError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(self.reply.clone())
        }

        fn model_name(&self) -> &str {
            "recording"
        }
    }

    #[tokio::test]
    async fn test_generate_trims_reply() {
        let model = Arc::new(Recording {
            reply: "  Repatha is given subcutaneously.\n".into(),
            seen: Mutex::new(vec![]),
        });
        let g = GroundedGenerator::new(model.clone());
        let text = g
            .generate(
                &RewrittenQuery::unchanged("How is Repatha given?"),
                &evidence(&["subcutaneous injection"]),
                &MemoryView::empty(),
            )
            .await
            .unwrap();
        assert_eq!(text, "Repatha is given subcutaneously.");
        assert_eq!(model.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_generate_empty_reply_is_error() {
        let model = Arc::new(Recording {
            reply: "   ".into(),
            seen: Mutex::new(vec![]),
        });
        let err = GroundedGenerator::new(model)
            .generate(
                &RewrittenQuery::unchanged("q"),
                &evidence(&["x"]),
                &MemoryView::empty(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::InferenceUnavailable(_)));
    }
}
