use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Topic a question is routed to.
///
/// The on-topic labels follow the section structure of the case-study
/// document. `OffTopic` is the distinguished value for everything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Overview of the medical document.
    Overview,
    /// Drug profiles: mechanism, side effects, warnings, interactions.
    DrugInformation,
    /// Indications and clinical use of biologic treatments.
    Indications,
    /// Dosage and administration details.
    DosageAdministration,
    /// Comparative analysis between therapies.
    Comparison,
    /// Scientific references and clinical study sources.
    References,
    /// Outside the case-study corpus.
    OffTopic,
}

impl Topic {
    /// Every on-topic label, in tie-break order.
    pub const ON_TOPIC: [Topic; 6] = [
        Topic::Overview,
        Topic::DrugInformation,
        Topic::Indications,
        Topic::DosageAdministration,
        Topic::Comparison,
        Topic::References,
    ];

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Topic::Overview => "Overview",
            Topic::DrugInformation => "Drug Information",
            Topic::Indications => "Indications",
            Topic::DosageAdministration => "Dosage and Administration",
            Topic::Comparison => "Comparison",
            Topic::References => "References",
            Topic::OffTopic => "Off Topic",
        }
    }

    /// Machine label, identical to the serde representation.
    pub fn key(&self) -> &'static str {
        match self {
            Topic::Overview => "overview",
            Topic::DrugInformation => "drug_information",
            Topic::Indications => "indications",
            Topic::DosageAdministration => "dosage_administration",
            Topic::Comparison => "comparison",
            Topic::References => "references",
            Topic::OffTopic => "off_topic",
        }
    }

    /// Parse either the human or machine label, ignoring case and
    /// surrounding punctuation.
    pub fn parse_label(raw: &str) -> Option<Topic> {
        let cleaned = raw
            .trim()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase()
            .replace(['-', ' '], "_");
        let cleaned = cleaned.replace("_and_", "_");
        std::iter::once(Topic::OffTopic)
            .chain(Topic::ON_TOPIC)
            .find(|t| t.key() == cleaned || t.label().to_lowercase().replace(' ', "_") == cleaned)
    }

    pub fn is_off_topic(&self) -> bool {
        matches!(self, Topic::OffTopic)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where an answer came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Produced by the generator from a non-empty evidence set.
    Generated,
    /// Produced by the fallback handler.
    Fallback,
}

/// Why a fallback answer was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// Classifier placed the question outside the corpus.
    OffTopic,
    /// Nothing retrieved was graded relevant.
    NoEvidence,
    /// A collaborator failed or timed out.
    SystemUnavailable,
}

// =============================================================================
// Identifiers
// =============================================================================

/// Session identity: the user identifier entered at the prompt.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Retrieval and grading
// =============================================================================

/// Location of a chunk in the source document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// 1-based page number, when known.
    #[serde(default)]
    pub page: Option<u32>,
    /// Section heading, when known.
    #[serde(default)]
    pub section: Option<String>,
}

/// A chunk returned by the retriever, unscored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    /// Opaque chunk identifier.
    pub id: String,
    /// Raw chunk text.
    pub text: String,
    #[serde(default)]
    pub source: SourceMetadata,
}

impl RetrievedDocument {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            source: SourceMetadata::default(),
        }
    }
}

/// A retrieved chunk with its relevance verdict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradedDocument {
    pub document: RetrievedDocument,
    pub relevant: bool,
    /// Grader score in `[0.0, 1.0]`.
    pub score: f32,
}

/// The question after reference resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewrittenQuery {
    pub text: String,
    /// True when the text differs from the raw question.
    pub changed: bool,
}

impl RewrittenQuery {
    /// A query that passed through the rewriter untouched.
    pub fn unchanged(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            changed: false,
        }
    }

    /// Build from the raw and rewritten texts, deriving `changed`.
    pub fn from_rewrite(raw: &str, rewritten: impl Into<String>) -> Self {
        let text = rewritten.into();
        let changed = text != raw;
        Self { text, changed }
    }
}

// =============================================================================
// Answers, turns, feedback
// =============================================================================

/// The reply returned to the user for one turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// Relevant documents the answer was grounded on, in retrieval rank order.
    /// Always empty for fallback answers.
    pub evidence: Vec<GradedDocument>,
    pub provenance: Provenance,
    /// Set for fallback answers only.
    pub fallback_reason: Option<FallbackReason>,
}

impl Answer {
    pub fn generated(text: impl Into<String>, evidence: Vec<GradedDocument>) -> Self {
        Self {
            text: text.into(),
            evidence,
            provenance: Provenance::Generated,
            fallback_reason: None,
        }
    }

    pub fn fallback(text: impl Into<String>, reason: FallbackReason) -> Self {
        Self {
            text: text.into(),
            evidence: Vec::new(),
            provenance: Provenance::Fallback,
            fallback_reason: Some(reason),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.provenance == Provenance::Fallback
    }
}

/// One completed question/answer exchange within a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Position within the session, starting at 0.
    pub index: usize,
    pub question: String,
    pub rewritten: RewrittenQuery,
    /// `None` when the turn failed before classification finished.
    pub topic: Option<Topic>,
    pub graded: Vec<GradedDocument>,
    pub answer: Answer,
    pub timestamp: DateTime<Utc>,
    /// Helpful / not helpful, set once after the answer was shown.
    pub feedback: Option<bool>,
}

/// Characters of chunk text kept in a feedback record.
pub const EVIDENCE_SNIPPET_CHARS: usize = 300;

/// A chunk an answer was grounded on, as logged with feedback.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSnippet {
    pub id: String,
    /// Leading text of the chunk, newlines flattened to spaces.
    pub snippet: String,
}

impl EvidenceSnippet {
    pub fn from_graded(graded: &GradedDocument) -> Self {
        Self {
            id: graded.document.id.clone(),
            snippet: graded
                .document
                .text
                .chars()
                .take(EVIDENCE_SNIPPET_CHARS)
                .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
                .collect(),
        }
    }
}

/// Append-only record of a user's verdict on one answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: Uuid,
    pub session_id: SessionId,
    pub turn_index: usize,
    pub question: String,
    pub rewritten_question: String,
    pub answer: String,
    pub provenance: Provenance,
    /// Chunks the answer was grounded on. Empty for fallback answers.
    #[serde(default)]
    pub evidence: Vec<EvidenceSnippet>,
    pub helpful: bool,
    pub timestamp: DateTime<Utc>,
}

impl FeedbackRecord {
    /// Build a record for `turn` in `session_id`.
    pub fn for_turn(session_id: &SessionId, turn: &Turn, helpful: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.clone(),
            turn_index: turn.index,
            question: turn.question.clone(),
            rewritten_question: turn.rewritten.text.clone(),
            answer: turn.answer.text.clone(),
            provenance: turn.answer.provenance,
            evidence: turn
                .answer
                .evidence
                .iter()
                .map(EvidenceSnippet::from_graded)
                .collect(),
            helpful,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_turn() -> Turn {
        Turn {
            index: 3,
            question: "What about it?".to_string(),
            rewritten: RewrittenQuery::from_rewrite("What about it?", "What about Repatha?"),
            topic: Some(Topic::DrugInformation),
            graded: vec![],
            answer: Answer::generated(
                "Repatha is a PCSK9 inhibitor.",
                vec![GradedDocument {
                    document: RetrievedDocument::new("c1", "Repatha (evolocumab)"),
                    relevant: true,
                    score: 0.9,
                }],
            ),
            timestamp: Utc::now(),
            feedback: None,
        }
    }

    #[test]
    fn test_topic_labels() {
        assert_eq!(Topic::DrugInformation.label(), "Drug Information");
        assert_eq!(Topic::DrugInformation.to_string(), "Drug Information");
        assert_eq!(Topic::OffTopic.key(), "off_topic");
    }

    #[test]
    fn test_topic_parse_label_variants() {
        assert_eq!(Topic::parse_label("Drug Information"), Some(Topic::DrugInformation));
        assert_eq!(Topic::parse_label("drug_information"), Some(Topic::DrugInformation));
        assert_eq!(Topic::parse_label("  dosage and administration. "), Some(Topic::DosageAdministration));
        assert_eq!(Topic::parse_label("OFF-TOPIC"), Some(Topic::OffTopic));
        assert_eq!(Topic::parse_label("References"), Some(Topic::References));
        assert_eq!(Topic::parse_label("weather"), None);
        assert_eq!(Topic::parse_label(""), None);
    }

    #[test]
    fn test_topic_serde_matches_key() {
        for topic in Topic::ON_TOPIC.iter().chain(std::iter::once(&Topic::OffTopic)) {
            let json = serde_json::to_string(topic).unwrap();
            assert_eq!(json, format!("\"{}\"", topic.key()));
        }
    }

    #[test]
    fn test_on_topic_excludes_off_topic() {
        assert!(!Topic::ON_TOPIC.contains(&Topic::OffTopic));
        assert!(Topic::OffTopic.is_off_topic());
        assert!(!Topic::Overview.is_off_topic());
    }

    #[test]
    fn test_rewritten_query_changed_flag() {
        let q = RewrittenQuery::from_rewrite("dose of it?", "dose of Repatha?");
        assert!(q.changed);
        let q = RewrittenQuery::from_rewrite("dose of Repatha?", "dose of Repatha?");
        assert!(!q.changed);
        assert!(!RewrittenQuery::unchanged("x").changed);
    }

    #[test]
    fn test_fallback_answer_has_no_evidence() {
        let a = Answer::fallback("Not covered.", FallbackReason::NoEvidence);
        assert!(a.is_fallback());
        assert!(a.evidence.is_empty());
        assert_eq!(a.fallback_reason, Some(FallbackReason::NoEvidence));
    }

    #[test]
    fn test_generated_answer_provenance() {
        let a = Answer::generated("text", vec![]);
        assert_eq!(a.provenance, Provenance::Generated);
        assert!(a.fallback_reason.is_none());
    }

    #[test]
    fn test_feedback_record_for_turn() {
        let turn = sample_turn();
        let sid = SessionId::new("alice");
        let record = FeedbackRecord::for_turn(&sid, &turn, true);
        assert_eq!(record.session_id.as_str(), "alice");
        assert_eq!(record.turn_index, 3);
        assert_eq!(record.question, "What about it?");
        assert_eq!(record.rewritten_question, "What about Repatha?");
        assert_eq!(record.provenance, Provenance::Generated);
        assert_eq!(
            record.evidence,
            vec![EvidenceSnippet {
                id: "c1".into(),
                snippet: "Repatha (evolocumab)".into(),
            }]
        );
        assert!(record.helpful);
    }

    #[test]
    fn test_evidence_snippet_is_truncated_and_flattened() {
        let long = format!("line one\nline two {}", "x".repeat(400));
        let snippet = EvidenceSnippet::from_graded(&GradedDocument {
            document: RetrievedDocument::new("c9", long),
            relevant: true,
            score: 0.8,
        });
        assert_eq!(snippet.snippet.chars().count(), EVIDENCE_SNIPPET_CHARS);
        assert!(snippet.snippet.starts_with("line one line two"));
    }

    #[test]
    fn test_fallback_feedback_has_no_evidence() {
        let mut turn = sample_turn();
        turn.answer = Answer::fallback("Not covered.", FallbackReason::NoEvidence);
        let record = FeedbackRecord::for_turn(&SessionId::new("carol"), &turn, false);
        assert!(record.evidence.is_empty());
    }

    #[test]
    fn test_feedback_record_serializes_on_one_line() {
        let turn = sample_turn();
        let record = FeedbackRecord::for_turn(&SessionId::new("bob"), &turn, false);
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains("\"session_id\":\"bob\""));
        assert!(line.contains("\"helpful\":false"));
    }

    #[test]
    fn test_retrieved_document_source_defaults() {
        let doc: RetrievedDocument =
            serde_json::from_str(r#"{"id":"p3-1","text":"Aimovig dosing"}"#).unwrap();
        assert_eq!(doc.source, SourceMetadata::default());
    }
}
