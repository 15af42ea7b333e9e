//! Topic classification.
//!
//! Routes a rewritten question to one of the case-study sections, or to
//! [`Topic::OffTopic`] when it has nothing to do with the corpus.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use medrag_core::{CollaboratorError, RewrittenQuery, Topic};
use medrag_llm::{InferenceModel, InferenceRequest};

use crate::rewriter::EntityVocabulary;

/// Assigns exactly one topic to a question.
#[async_trait]
pub trait TopicClassifier: Send + Sync {
    /// Fails with [`CollaboratorError::ClassificationAmbiguous`] when no
    /// single topic can be read from the backend's verdict.
    async fn classify(&self, query: &RewrittenQuery) -> Result<Topic, CollaboratorError>;
}

// =============================================================================
// KeywordClassifier
// =============================================================================

struct TopicPatterns {
    topic: Topic,
    patterns: Vec<Regex>,
}

static TOPIC_PATTERNS: LazyLock<Vec<TopicPatterns>> = LazyLock::new(|| {
    let table: [(Topic, &[&str]); 6] = [
        (
            Topic::Overview,
            &[
                r"(?i)\boverview\b",
                r"(?i)\bsummar(?:y|ize|ise)\b",
                r"(?i)\bcase\s+stud(?:y|ies)\b",
                r"(?i)\b(?:this|the)\s+document\b",
                r"(?i)\b(?:introduction|background)\b",
            ],
        ),
        (
            Topic::DrugInformation,
            &[
                r"(?i)\bside[\s-]+effects?\b",
                r"(?i)\badverse\b",
                r"(?i)\bmechanism\b",
                r"(?i)\bwarnings?\b",
                r"(?i)\binteractions?\b",
                r"(?i)\bcontraindicat\w*",
                r"(?i)\b(?:precautions?|safety)\b",
                r"(?i)\bhow\s+does\s+\w+\s+work\b",
            ],
        ),
        (
            Topic::Indications,
            &[
                r"(?i)\bindicat(?:ion|ions|ed)\b",
                r"(?i)\bused\s+(?:for|to\s+treat)\b",
                r"(?i)\btreat(?:s|ing)?\b",
                r"(?i)\bclinical\s+use\b",
                r"(?i)\bapproved\s+for\b",
                r"(?i)\bwho\s+should\s+(?:take|use)\b",
            ],
        ),
        (
            Topic::DosageAdministration,
            &[
                r"(?i)\bdos(?:e|es|age|ing)\b",
                r"(?i)\badminist\w*",
                r"(?i)\binject(?:ion|ions|ed)?\b",
                r"(?i)\bhow\s+often\b",
                r"(?i)\b\d+\s*mg\b",
                r"(?i)\b(?:autoinjector|pre-?filled|subcutaneous(?:ly)?)\b",
            ],
        ),
        (
            Topic::Comparison,
            &[
                r"(?i)\bcompar(?:e|ed|ison|ing)\b",
                r"(?i)\b(?:versus|vs\.?)(?:\s|$)",
                r"(?i)\bdifferen(?:ce|ces|t)\s+(?:between|from)\b",
                r"(?i)\bbetter\s+than\b",
                r"(?i)\bdiffer\b",
            ],
        ),
        (
            Topic::References,
            &[
                r"(?i)\breferences?\b",
                r"(?i)\bcitations?\b",
                r"(?i)\bsources?\b",
                r"(?i)\b(?:clinical\s+)?trials?\b",
                r"(?i)\bstud(?:y|ies)\b",
                r"(?i)\b(?:journal|publication|published)\b",
            ],
        ),
    ];

    table
        .into_iter()
        .map(|(topic, patterns)| TopicPatterns {
            topic,
            patterns: patterns
                .iter()
                .map(|p| Regex::new(p).expect("Invalid topic regex"))
                .collect(),
        })
        .collect()
});

/// Deterministic classifier counting keyword matches per topic.
///
/// Each matching pattern scores one point; every known drug named in the
/// question scores one point for [`Topic::DrugInformation`]. The highest
/// score wins, ties go to the topic listed first in [`Topic::ON_TOPIC`].
/// A best score below `min_score` means off-topic.
pub struct KeywordClassifier {
    vocabulary: EntityVocabulary,
    min_score: u32,
}

impl KeywordClassifier {
    pub fn new(vocabulary: EntityVocabulary, min_score: u32) -> Self {
        Self {
            vocabulary,
            min_score: min_score.max(1),
        }
    }

    /// Score for every on-topic label, in [`Topic::ON_TOPIC`] order.
    pub fn scores(&self, text: &str) -> Vec<(Topic, u32)> {
        let entity_hits = self.vocabulary.mention_count(text) as u32;

        TOPIC_PATTERNS
            .iter()
            .map(|tp| {
                let mut score = tp.patterns.iter().filter(|re| re.is_match(text)).count() as u32;
                if tp.topic == Topic::DrugInformation {
                    score += entity_hits;
                }
                (tp.topic, score)
            })
            .collect()
    }

    /// Pure classification over plain text.
    pub fn classify_text(&self, text: &str) -> Topic {
        let mut best = (Topic::OffTopic, 0u32);
        for (topic, score) in self.scores(text) {
            // Strictly greater keeps the earlier topic on ties.
            if score > best.1 {
                best = (topic, score);
            }
        }
        if best.1 < self.min_score {
            Topic::OffTopic
        } else {
            best.0
        }
    }
}

#[async_trait]
impl TopicClassifier for KeywordClassifier {
    async fn classify(&self, query: &RewrittenQuery) -> Result<Topic, CollaboratorError> {
        let topic = self.classify_text(&query.text);
        debug!(topic = %topic, "Keyword classification");
        Ok(topic)
    }
}

// =============================================================================
// ModelClassifier
// =============================================================================

/// Asks the language model to pick one label.
pub struct ModelClassifier {
    model: Arc<dyn InferenceModel>,
}

impl ModelClassifier {
    pub fn new(model: Arc<dyn InferenceModel>) -> Self {
        Self { model }
    }

    fn build_request(query: &RewrittenQuery) -> InferenceRequest {
        let mut labels: Vec<String> = Topic::ON_TOPIC
            .iter()
            .map(|t| format!("- {}", t.label()))
            .collect();
        labels.push(format!(
            "- {} (anything not covered by the medical case-study documents)",
            Topic::OffTopic.label()
        ));

        let system = format!(
            "You route questions about a medical case study covering biologic drugs. \
             Classify the question into exactly one of these topics:\n{}\n\
             Reply with the topic label only.",
            labels.join("\n")
        );
        InferenceRequest::new(system, format!("Question: {}", query.text)).with_temperature(0.0)
    }
}

/// Read a single topic out of a model reply.
///
/// Accepts a bare label, or free text mentioning exactly one label.
pub fn parse_topic(raw: &str) -> Result<Topic, CollaboratorError> {
    let first_line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let first_line = first_line
        .trim_start_matches(|c: char| c == '-' || c == '*' || c.is_whitespace())
        .trim_start_matches("Topic:")
        .trim();
    if let Some(topic) = Topic::parse_label(first_line) {
        return Ok(topic);
    }

    let lower = raw.to_lowercase();
    let found: Vec<Topic> = std::iter::once(Topic::OffTopic)
        .chain(Topic::ON_TOPIC)
        .filter(|t| {
            let label = t.label().to_lowercase();
            lower.contains(&label)
                || lower.contains(t.key())
                || (t.is_off_topic() && lower.contains("off-topic"))
        })
        .collect();

    match found.as_slice() {
        [topic] => Ok(*topic),
        _ => Err(CollaboratorError::ClassificationAmbiguous(
            raw.trim().chars().take(200).collect(),
        )),
    }
}

#[async_trait]
impl TopicClassifier for ModelClassifier {
    async fn classify(&self, query: &RewrittenQuery) -> Result<Topic, CollaboratorError> {
        let raw = self.model.infer(&Self::build_request(query)).await?;
        let topic = parse_topic(&raw)?;
        debug!(model = self.model.model_name(), topic = %topic, "Model classification");
        Ok(topic)
    }
}
