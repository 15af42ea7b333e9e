//! Fallback answers for turns that cannot be answered from the corpus.

use tracing::debug;

use medrag_core::config::FallbackConfig;
use medrag_core::{Answer, FallbackReason, GradedDocument, Topic};

const DEFAULT_OFF_TOPIC: &str = "That question is outside the scope of this case study. I can \
answer questions about the documented drugs: overview, drug information, indications, dosage \
and administration, comparisons and references.";

const DEFAULT_NO_EVIDENCE: &str = "Sorry, I couldn't find an answer to that in the case-study \
documents ({topic}). Could you rephrase the question or name the drug you mean?";

const DEFAULT_SYSTEM_UNAVAILABLE: &str = "Sorry, I can't answer right now because a backing \
service is unavailable. Please try again in a moment.";

/// Maps a [`FallbackReason`] to a fixed reply.
///
/// Templates may contain `{topic}`, replaced by the topic label.
#[derive(Debug, Clone)]
pub struct FallbackHandler {
    off_topic: String,
    no_evidence: String,
    system_unavailable: String,
}

impl Default for FallbackHandler {
    fn default() -> Self {
        Self::new(&FallbackConfig::default())
    }
}

impl FallbackHandler {
    /// Configured templates override the defaults; blank ones are ignored.
    pub fn new(config: &FallbackConfig) -> Self {
        Self {
            off_topic: pick(&config.off_topic, DEFAULT_OFF_TOPIC),
            no_evidence: pick(&config.no_evidence, DEFAULT_NO_EVIDENCE),
            system_unavailable: pick(&config.system_unavailable, DEFAULT_SYSTEM_UNAVAILABLE),
        }
    }

    /// Build the fallback answer. The answer's evidence is always empty;
    /// `graded` only feeds the log.
    pub fn respond(
        &self,
        topic: Option<Topic>,
        graded: &[GradedDocument],
        reason: FallbackReason,
    ) -> Answer {
        let template = match reason {
            FallbackReason::OffTopic => &self.off_topic,
            FallbackReason::NoEvidence => &self.no_evidence,
            FallbackReason::SystemUnavailable => &self.system_unavailable,
        };
        let label = topic.map(|t| t.label()).unwrap_or("unclassified");
        debug!(?reason, topic = label, graded = graded.len(), "Fallback answer");
        Answer::fallback(template.replace("{topic}", label), reason)
    }
}

fn pick(configured: &Option<String>, default: &str) -> String {
    configured
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}
