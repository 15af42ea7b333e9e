//! Follow-up question rewriting.
//!
//! A follow-up such as "What is the dose of it?" only makes sense next to the
//! previous turn. The rewriter turns it into a standalone question by
//! resolving the reference to the drug discussed most recently. Questions
//! that already name a known drug, or contain no reference, pass through.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::{Captures, Regex};
use tracing::{debug, warn};

use medrag_core::{CollaboratorError, RewrittenQuery};
use medrag_llm::{InferenceModel, InferenceRequest};

use crate::memory::MemoryView;

/// Referential expressions that may stand for a drug. Longer phrases first.
static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:(?:this|that|the)\s+(?:drug|medication|medicine|treatment|therapy)|its|it|they|them)\b",
    )
    .expect("Invalid reference regex")
});

/// Rewrites a raw question into a standalone one.
#[async_trait]
pub trait QueryRewriter: Send + Sync {
    async fn rewrite(
        &self,
        question: &str,
        memory: &MemoryView,
    ) -> Result<RewrittenQuery, CollaboratorError>;
}

// =============================================================================
// EntityVocabulary
// =============================================================================

/// Known drug names, matched case-insensitively on word boundaries.
#[derive(Debug, Clone)]
pub struct EntityVocabulary {
    entities: Vec<(String, Regex)>,
}

impl EntityVocabulary {
    pub fn new(names: &[String]) -> Self {
        let entities = names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .filter_map(|name| {
                match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(name))) {
                    Ok(re) => Some((name.to_string(), re)),
                    Err(e) => {
                        warn!(entity = name, "Skipping entity with unusable pattern: {}", e);
                        None
                    }
                }
            })
            .collect();
        Self { entities }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|(n, _)| n.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Whether `text` names any known entity.
    pub fn mentions_any(&self, text: &str) -> bool {
        self.entities.iter().any(|(_, re)| re.is_match(text))
    }

    /// Number of distinct entities named in `text`.
    pub fn mention_count(&self, text: &str) -> usize {
        self.entities.iter().filter(|(_, re)| re.is_match(text)).count()
    }

    /// The entity named earliest in `text`.
    pub fn first_mention(&self, text: &str) -> Option<&str> {
        self.entities
            .iter()
            .filter_map(|(name, re)| re.find(text).map(|m| (m.start(), name.as_str())))
            .min_by_key(|(start, _)| *start)
            .map(|(_, name)| name)
    }

    /// Entity discussed most recently in `memory`.
    ///
    /// Looks at each recent turn's question, then its answer, newest turn
    /// first.
    pub fn most_recent(&self, memory: &MemoryView) -> Option<&str> {
        memory.recent_turns().iter().find_map(|turn| {
            self.first_mention(&turn.rewritten.text)
                .or_else(|| self.first_mention(&turn.question))
                .or_else(|| self.first_mention(&turn.answer.text))
        })
    }
}

/// Whether `question` contains a referential expression.
pub fn has_reference(question: &str) -> bool {
    REFERENCE_RE.is_match(question)
}

// =============================================================================
// ReferenceRewriter
// =============================================================================

/// Deterministic rewriter: substitutes the most recent entity for each
/// referential expression.
pub struct ReferenceRewriter {
    vocabulary: EntityVocabulary,
}

impl ReferenceRewriter {
    pub fn new(vocabulary: EntityVocabulary) -> Self {
        Self { vocabulary }
    }

    /// Pure rewrite, exposed for callers that hold no async context.
    pub fn resolve(&self, question: &str, memory: &MemoryView) -> RewrittenQuery {
        if !has_reference(question) || self.vocabulary.mentions_any(question) {
            return RewrittenQuery::unchanged(question);
        }
        let Some(entity) = self.vocabulary.most_recent(memory) else {
            return RewrittenQuery::unchanged(question);
        };

        let rewritten = REFERENCE_RE.replace_all(question, |caps: &Captures| {
            if caps[0].eq_ignore_ascii_case("its") {
                format!("{}'s", entity)
            } else {
                entity.to_string()
            }
        });
        RewrittenQuery::from_rewrite(question, rewritten.into_owned())
    }
}

#[async_trait]
impl QueryRewriter for ReferenceRewriter {
    async fn rewrite(
        &self,
        question: &str,
        memory: &MemoryView,
    ) -> Result<RewrittenQuery, CollaboratorError> {
        let rewritten = self.resolve(question, memory);
        if rewritten.changed {
            debug!(from = question, to = %rewritten.text, "Resolved reference");
        }
        Ok(rewritten)
    }
}

// =============================================================================
// ModelRewriter
// =============================================================================

const REWRITE_INSTRUCTION: &str = "Given the chat history and a follow-up question that may \
refer to earlier context, rephrase the follow-up as a standalone question that can be \
understood without the history. Keep the meaning unchanged. Do not answer it. Reply with the \
rephrased question only.";

/// Asks the language model to rephrase follow-ups that need resolving.
///
/// The model is only called when the question contains a reference, names no
/// known drug, and the session has history. Everything else passes through.
pub struct ModelRewriter {
    model: Arc<dyn InferenceModel>,
    vocabulary: EntityVocabulary,
}

impl ModelRewriter {
    pub fn new(model: Arc<dyn InferenceModel>, vocabulary: EntityVocabulary) -> Self {
        Self { model, vocabulary }
    }

    fn needs_model(&self, question: &str, memory: &MemoryView) -> bool {
        has_reference(question)
            && !self.vocabulary.mentions_any(question)
            && !memory.recent_turns().is_empty()
    }

    fn build_request(question: &str, memory: &MemoryView) -> InferenceRequest {
        let mut history = String::new();
        if !memory.summary().is_empty() {
            history.push_str("Earlier conversation:\n");
            history.push_str(memory.summary());
            history.push('\n');
        }
        for turn in memory.recent_turns().iter().rev() {
            history.push_str(&format!(
                "User: {}\nAssistant: {}\n",
                turn.rewritten.text, turn.answer.text
            ));
        }
        let user = format!(
            "Chat history:\n{}\nFollow-up question: {}\nStandalone question:",
            history, question
        );
        InferenceRequest::new(REWRITE_INSTRUCTION, user).with_temperature(0.0)
    }
}

#[async_trait]
impl QueryRewriter for ModelRewriter {
    async fn rewrite(
        &self,
        question: &str,
        memory: &MemoryView,
    ) -> Result<RewrittenQuery, CollaboratorError> {
        if !self.needs_model(question, memory) {
            return Ok(RewrittenQuery::unchanged(question));
        }

        let raw = self
            .model
            .infer(&Self::build_request(question, memory))
            .await?;
        let cleaned = raw
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("")
            .trim_matches(|c| c == '"' || c == '\'')
            .trim();

        if cleaned.is_empty() {
            warn!(model = self.model.model_name(), "Empty rewrite, keeping question");
            return Ok(RewrittenQuery::unchanged(question));
        }
        debug!(from = question, to = cleaned, "Model rewrote follow-up");
        Ok(RewrittenQuery::from_rewrite(question, cleaned))
    }
}
