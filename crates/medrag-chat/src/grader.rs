//! Relevance grading of retrieved chunks.
//!
//! Each chunk is scored on its own against the rewritten question; the
//! verdict of one chunk never depends on the others. Scoring runs with
//! bounded concurrency and the output keeps retrieval order.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use regex::Regex;
use tracing::{debug, warn};

use medrag_core::{CollaboratorError, GradedDocument, RetrievedDocument};
use medrag_llm::{InferenceModel, InferenceRequest};

/// Scores one document's relevance to a query.
#[async_trait]
pub trait DocumentScorer: Send + Sync {
    /// Relevance in `[0.0, 1.0]`.
    async fn score(&self, query: &str, document: &RetrievedDocument)
        -> Result<f32, CollaboratorError>;
}

/// Grades retrieved documents with a [`DocumentScorer`].
pub struct RelevanceGrader {
    scorer: Arc<dyn DocumentScorer>,
    cutoff: f32,
    max_concurrency: usize,
    call_timeout: Duration,
}

impl RelevanceGrader {
    pub fn new(
        scorer: Arc<dyn DocumentScorer>,
        cutoff: f32,
        max_concurrency: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            scorer,
            cutoff,
            max_concurrency: max_concurrency.max(1),
            call_timeout,
        }
    }

    /// Grade every document. The result has the input's length and order.
    ///
    /// Any scorer failure or timeout fails the whole batch.
    pub async fn grade(
        &self,
        query: &str,
        documents: Vec<RetrievedDocument>,
    ) -> Result<Vec<GradedDocument>, CollaboratorError> {
        let total = documents.len();
        let graded: Vec<Result<GradedDocument, CollaboratorError>> =
            stream::iter(documents.into_iter().map(|document| self.grade_one(query, document)))
                .buffered(self.max_concurrency)
                .collect()
                .await;
        let graded = graded.into_iter().collect::<Result<Vec<_>, _>>()?;

        debug!(
            total,
            relevant = graded.iter().filter(|g| g.relevant).count(),
            "Grading complete"
        );
        Ok(graded)
    }

    async fn grade_one(
        &self,
        query: &str,
        document: RetrievedDocument,
    ) -> Result<GradedDocument, CollaboratorError> {
        let score = tokio::time::timeout(self.call_timeout, self.scorer.score(query, &document))
            .await
            .map_err(|_| CollaboratorError::InferenceTimeout(self.call_timeout))??;
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        Ok(GradedDocument {
            relevant: score >= self.cutoff,
            score,
            document,
        })
    }
}

/// Relevant documents only, in their original order.
pub fn evidence_set(graded: &[GradedDocument]) -> Vec<GradedDocument> {
    graded.iter().filter(|g| g.relevant).cloned().collect()
}

// =============================================================================
// ModelScorer
// =============================================================================

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?|\.\d+)(\s*%)?").expect("Invalid number regex")
});

/// `8/10`, `4 out of 5`.
static RATIO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*(?:/|out of)\s*(\d+(?:\.\d+)?)").expect("Invalid ratio regex")
});

/// A number introduced by a score label: `score: 0.7`, `relevance is 85%`.
static LABELLED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:score|relevance|rating)\b[^0-9.]{0,20}(\d+(?:\.\d+)?|\.\d+)(\s*%)?")
        .expect("Invalid labelled score regex")
});

/// Verdict word opening the reply.
static LEADING_VERDICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(not relevant|irrelevant|no)|(yes|relevant))\b")
        .expect("Invalid verdict regex")
});

static NEGATIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:not relevant|irrelevant|not related|unrelated)\b")
        .expect("Invalid negative verdict regex")
});

static POSITIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\brelevant\b").expect("Invalid positive verdict regex"));

const GRADE_INSTRUCTION: &str = "You are a grader assessing the relevance of a retrieved \
document to a user question. If the document contains keywords or meaning related to the \
question, it is relevant. Reply with a relevance score between 0 and 1, or with Yes or No.";

/// Grades with the language model.
pub struct ModelScorer {
    model: Arc<dyn InferenceModel>,
}

impl ModelScorer {
    pub fn new(model: Arc<dyn InferenceModel>) -> Self {
        Self { model }
    }

    fn build_request(query: &str, document: &RetrievedDocument) -> InferenceRequest {
        InferenceRequest::new(
            GRADE_INSTRUCTION,
            format!(
                "Retrieved document:\n{}\n\nUser question: {}",
                document.text, query
            ),
        )
        .with_temperature(0.0)
    }
}

/// Read a score out of a grader reply.
///
/// Tried in order: a leading yes/no verdict, a ratio (`8/10`, `4 out of 5`),
/// a number after a score label, a percentage, the last number in `[0, 1]`,
/// a bare number above 1 read as a percentage, and finally a relevant /
/// not relevant verdict anywhere in the text. Returns `None` when nothing
/// usable is found.
pub fn parse_score(raw: &str) -> Option<f32> {
    let lower = raw.trim().to_lowercase();
    let text = lower.trim_start_matches(|c: char| !c.is_alphanumeric() && c != '.');

    if let Some(caps) = LEADING_VERDICT_RE.captures(text) {
        return Some(if caps.get(1).is_some() { 0.0 } else { 1.0 });
    }

    if let Some(caps) = RATIO_RE.captures_iter(text).last() {
        let num: f32 = caps[1].parse().ok()?;
        let den: f32 = caps[2].parse().ok()?;
        if den > 0.0 {
            return Some((num / den).clamp(0.0, 1.0));
        }
    }

    if let Some(caps) = LABELLED_RE.captures(text) {
        let value: f32 = caps[1].parse().ok()?;
        return Some(normalize(value, caps.get(2).is_some()));
    }

    let mut last_unit = None;
    let mut last_percent = None;
    let mut first_large = None;
    for caps in NUMBER_RE.captures_iter(text) {
        let Ok(value) = caps[1].parse::<f32>() else {
            continue;
        };
        if caps.get(2).is_some() {
            last_percent = Some(value);
        } else if value <= 1.0 {
            last_unit = Some(value);
        } else if first_large.is_none() {
            first_large = Some(value);
        }
    }
    if let Some(value) = last_percent {
        return Some(normalize(value, true));
    }
    if let Some(value) = last_unit {
        return Some(value);
    }
    if let Some(value) = first_large {
        return Some(normalize(value, true));
    }

    if NEGATIVE_RE.is_match(text) {
        return Some(0.0);
    }
    if POSITIVE_RE.is_match(text) {
        return Some(1.0);
    }
    None
}

fn normalize(value: f32, percent: bool) -> f32 {
    let value = if percent || value > 1.0 {
        value / 100.0
    } else {
        value
    };
    value.clamp(0.0, 1.0)
}

#[async_trait]
impl DocumentScorer for ModelScorer {
    async fn score(
        &self,
        query: &str,
        document: &RetrievedDocument,
    ) -> Result<f32, CollaboratorError> {
        let raw = self
            .model
            .infer(&Self::build_request(query, document))
            .await?;
        match parse_score(&raw) {
            Some(score) => Ok(score),
            None => {
                warn!(
                    document = %document.id,
                    reply = %raw.chars().take(80).collect::<String>(),
                    "Unreadable relevance verdict, treating as irrelevant"
                );
                Ok(0.0)
            }
        }
    }
}
