//! Turn orchestrator: runs one question through the stage graph.
//!
//! Stages read memory through a [`MemoryView`] taken at the start of the
//! turn. Intermediate results live in locals; the session is touched once, in
//! RECORD, after the answer is final. A turn dropped before RECORD leaves the
//! session as it was.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use medrag_core::{
    Answer, CollaboratorError, FallbackReason, GradedDocument, MedragConfig, RewrittenQuery,
    Topic, Turn,
};
use medrag_retrieval::Retriever;

use crate::classifier::TopicClassifier;
use crate::fallback::FallbackHandler;
use crate::generator::AnswerGenerator;
use crate::grader::{evidence_set, RelevanceGrader};
use crate::graph::{Stage, StagePath};
use crate::memory::{MemoryView, Session};
use crate::rewriter::QueryRewriter;

/// Limits applied to every turn.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Chunks requested from the retriever.
    pub k: usize,
    pub retrieval_timeout: Duration,
    /// Upper bound on one model-backed stage, retries included.
    pub inference_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &MedragConfig) -> Self {
        let attempts = config.model.max_retries + 1;
        // Room for the adapter's own retry backoff, which tops out at 6.4s.
        let backoff = Duration::from_millis(6_400) * config.model.max_retries;
        Self {
            k: config.retrieval.k,
            retrieval_timeout: config.retrieval.timeout(),
            inference_timeout: config.model.timeout() * attempts + backoff,
        }
    }
}

/// Result of one turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub turn_index: usize,
    pub answer: Answer,
    pub rewritten: RewrittenQuery,
    pub topic: Option<Topic>,
    /// Stages visited, `Start` through `End`.
    pub path: Vec<Stage>,
}

/// Working state of a turn between stages.
struct Draft {
    rewritten: RewrittenQuery,
    topic: Option<Topic>,
    graded: Vec<GradedDocument>,
}

/// Runs the stage graph for one session turn at a time.
pub struct Orchestrator {
    rewriter: Arc<dyn QueryRewriter>,
    classifier: Arc<dyn TopicClassifier>,
    retriever: Arc<dyn Retriever>,
    grader: RelevanceGrader,
    generator: Arc<dyn AnswerGenerator>,
    fallback: FallbackHandler,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        rewriter: Arc<dyn QueryRewriter>,
        classifier: Arc<dyn TopicClassifier>,
        retriever: Arc<dyn Retriever>,
        grader: RelevanceGrader,
        generator: Arc<dyn AnswerGenerator>,
        fallback: FallbackHandler,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            rewriter,
            classifier,
            retriever,
            grader,
            generator,
            fallback,
            settings,
        }
    }

    /// Answer `question` and record the turn in `session`.
    ///
    /// Always produces exactly one answer: collaborator failures become a
    /// system-unavailable fallback.
    pub async fn run_turn(&self, session: &mut Session, question: &str) -> TurnOutcome {
        let view = session.view();
        let mut path = StagePath::new();
        let mut draft = Draft {
            rewritten: RewrittenQuery::unchanged(question),
            topic: None,
            graded: Vec::new(),
        };

        let answer = self.answer(question, &view, &mut draft, &mut path).await;

        advance(&mut path, Stage::Record);
        let turn = Turn {
            index: session.next_index(),
            question: question.to_string(),
            rewritten: draft.rewritten.clone(),
            topic: draft.topic,
            graded: draft.graded,
            answer: answer.clone(),
            timestamp: Utc::now(),
            feedback: None,
        };
        let turn_index = session.append(turn);
        advance(&mut path, Stage::End);

        info!(
            session = %session.id(),
            turn = turn_index,
            topic = %draft.topic.map(|t| t.label()).unwrap_or("-"),
            provenance = ?answer.provenance,
            evidence = answer.evidence.len(),
            "Turn recorded"
        );

        TurnOutcome {
            turn_index,
            answer,
            rewritten: draft.rewritten,
            topic: draft.topic,
            path: path.into_stages(),
        }
    }

    /// Stages Rewrite through Generate or Fallback.
    async fn answer(
        &self,
        question: &str,
        view: &MemoryView,
        draft: &mut Draft,
        path: &mut StagePath,
    ) -> Answer {
        // REWRITE
        advance(path, Stage::Rewrite);
        match self
            .bounded(self.settings.inference_timeout, self.rewriter.rewrite(question, view))
            .await
        {
            Ok(rewritten) => {
                if rewritten.changed {
                    debug!(from = question, to = %rewritten.text, "Question rewritten");
                }
                draft.rewritten = rewritten;
            }
            Err(e) => return self.system_fallback(Stage::Rewrite, &e, draft, path),
        }

        // CLASSIFY
        advance(path, Stage::Classify);
        let topic = match self
            .bounded(
                self.settings.inference_timeout,
                self.classifier.classify(&draft.rewritten),
            )
            .await
        {
            Ok(topic) => topic,
            Err(CollaboratorError::ClassificationAmbiguous(raw)) => {
                warn!(verdict = %raw, "Ambiguous classification, treating as off-topic");
                Topic::OffTopic
            }
            Err(e) => return self.system_fallback(Stage::Classify, &e, draft, path),
        };
        draft.topic = Some(topic);
        debug!(topic = %topic, "Question classified");

        if topic.is_off_topic() {
            advance(path, Stage::Fallback);
            return self
                .fallback
                .respond(Some(topic), &[], FallbackReason::OffTopic);
        }

        // RETRIEVE
        advance(path, Stage::Retrieve);
        let documents = match tokio::time::timeout(
            self.settings.retrieval_timeout,
            self.retriever.search(&draft.rewritten.text, self.settings.k),
        )
        .await
        {
            Ok(Ok(documents)) => documents,
            Ok(Err(e)) => return self.system_fallback(Stage::Retrieve, &e, draft, path),
            Err(_) => {
                let e = CollaboratorError::RetrievalUnavailable(format!(
                    "timed out after {:?}",
                    self.settings.retrieval_timeout
                ));
                return self.system_fallback(Stage::Retrieve, &e, draft, path);
            }
        };
        debug!(retrieved = documents.len(), "Documents retrieved");

        // GRADE
        advance(path, Stage::Grade);
        match self.grader.grade(&draft.rewritten.text, documents).await {
            Ok(graded) => draft.graded = graded,
            Err(e) => return self.system_fallback(Stage::Grade, &e, draft, path),
        }
        let evidence = evidence_set(&draft.graded);
        if evidence.is_empty() {
            advance(path, Stage::Fallback);
            return self
                .fallback
                .respond(Some(topic), &draft.graded, FallbackReason::NoEvidence);
        }

        // GENERATE
        advance(path, Stage::Generate);
        match self
            .bounded(
                self.settings.inference_timeout,
                self.generator.generate(&draft.rewritten, &evidence, view),
            )
            .await
        {
            Ok(text) => Answer::generated(text, evidence),
            Err(e) => self.system_fallback(Stage::Generate, &e, draft, path),
        }
    }

    /// Await a model-backed stage, mapping an elapsed deadline to
    /// [`CollaboratorError::InferenceTimeout`].
    async fn bounded<T>(
        &self,
        limit: Duration,
        fut: impl Future<Output = Result<T, CollaboratorError>>,
    ) -> Result<T, CollaboratorError> {
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(CollaboratorError::InferenceTimeout(limit)))
    }

    fn system_fallback(
        &self,
        stage: Stage,
        err: &CollaboratorError,
        draft: &Draft,
        path: &mut StagePath,
    ) -> Answer {
        warn!(stage = %stage, error = %err, "Collaborator failed, falling back");
        advance(path, Stage::Fallback);
        self.fallback
            .respond(draft.topic, &draft.graded, FallbackReason::SystemUnavailable)
    }
}

/// Follow a graph edge. The orchestrator only takes edges that exist, so a
/// rejected one is logged rather than surfaced.
fn advance(path: &mut StagePath, to: Stage) {
    match path.advance(to) {
        Ok(()) => debug!(stage = %to, "Stage entered"),
        Err(e) => error!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use medrag_core::config::MemoryConfig;
    use medrag_core::{Provenance, RetrievedDocument, SessionId};

    use crate::grader::DocumentScorer;

    struct Echo;

    #[async_trait]
    impl QueryRewriter for Echo {
        async fn rewrite(
            &self,
            question: &str,
            _memory: &MemoryView,
        ) -> Result<RewrittenQuery, CollaboratorError> {
            Ok(RewrittenQuery::unchanged(question))
        }
    }

    struct Fixed(Result<Topic, CollaboratorError>);

    #[async_trait]
    impl TopicClassifier for Fixed {
        async fn classify(&self, _query: &RewrittenQuery) -> Result<Topic, CollaboratorError> {
            self.0.clone()
        }
    }

    struct Docs {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Retriever for Docs {
        async fn search(
            &self,
            _query: &str,
            k: usize,
        ) -> Result<Vec<RetrievedDocument>, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok((0..k)
                .map(|i| RetrievedDocument::new(format!("c{}", i), "Repatha text"))
                .collect())
        }
    }

    struct Constant(f32);

    #[async_trait]
    impl DocumentScorer for Constant {
        async fn score(
            &self,
            _query: &str,
            _document: &RetrievedDocument,
        ) -> Result<f32, CollaboratorError> {
            Ok(self.0)
        }
    }

    struct Reply;

    #[async_trait]
    impl AnswerGenerator for Reply {
        async fn generate(
            &self,
            _query: &RewrittenQuery,
            evidence: &[GradedDocument],
            _memory: &MemoryView,
        ) -> Result<String, CollaboratorError> {
            Ok(format!("answer from {} passages", evidence.len()))
        }
    }

    /// Sleeps past any short deadline, whichever stage it stands in for.
    struct Stall(Duration);

    #[async_trait]
    impl QueryRewriter for Stall {
        async fn rewrite(
            &self,
            question: &str,
            _memory: &MemoryView,
        ) -> Result<RewrittenQuery, CollaboratorError> {
            tokio::time::sleep(self.0).await;
            Ok(RewrittenQuery::unchanged(question))
        }
    }

    #[async_trait]
    impl TopicClassifier for Stall {
        async fn classify(&self, _query: &RewrittenQuery) -> Result<Topic, CollaboratorError> {
            tokio::time::sleep(self.0).await;
            Ok(Topic::Overview)
        }
    }

    #[async_trait]
    impl AnswerGenerator for Stall {
        async fn generate(
            &self,
            _query: &RewrittenQuery,
            _evidence: &[GradedDocument],
            _memory: &MemoryView,
        ) -> Result<String, CollaboratorError> {
            tokio::time::sleep(self.0).await;
            Ok("too late".into())
        }
    }

    fn short_deadline() -> OrchestratorSettings {
        OrchestratorSettings {
            inference_timeout: Duration::from_millis(50),
            ..settings()
        }
    }

    fn docs() -> Arc<Docs> {
        Arc::new(Docs {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        })
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            k: 2,
            retrieval_timeout: Duration::from_millis(200),
            inference_timeout: Duration::from_secs(5),
        }
    }

    fn orchestrator(
        topic: Result<Topic, CollaboratorError>,
        score: f32,
        retrieval_delay: Duration,
    ) -> (Orchestrator, Arc<Docs>) {
        let docs = Arc::new(Docs {
            calls: AtomicUsize::new(0),
            delay: retrieval_delay,
        });
        let orch = Orchestrator::new(
            Arc::new(Echo),
            Arc::new(Fixed(topic)),
            docs.clone(),
            RelevanceGrader::new(Arc::new(Constant(score)), 0.5, 2, Duration::from_secs(1)),
            Arc::new(Reply),
            FallbackHandler::default(),
            settings(),
        );
        (orch, docs)
    }

    fn session() -> Session {
        Session::new(SessionId::new("t"), &MemoryConfig::default())
    }

    #[tokio::test]
    async fn test_generated_path() {
        let (orch, _) = orchestrator(Ok(Topic::DrugInformation), 0.9, Duration::ZERO);
        let mut s = session();
        let out = orch.run_turn(&mut s, "Side effects of Repatha?").await;

        assert_eq!(out.answer.provenance, Provenance::Generated);
        assert_eq!(out.answer.evidence.len(), 2);
        assert_eq!(out.answer.text, "answer from 2 passages");
        assert_eq!(
            out.path,
            vec![
                Stage::Start,
                Stage::Rewrite,
                Stage::Classify,
                Stage::Retrieve,
                Stage::Grade,
                Stage::Generate,
                Stage::Record,
                Stage::End
            ]
        );
        assert_eq!(s.turn_count(), 1);
    }

    #[tokio::test]
    async fn test_no_evidence_path_keeps_graded() {
        let (orch, _) = orchestrator(Ok(Topic::Indications), 0.1, Duration::ZERO);
        let mut s = session();
        let out = orch.run_turn(&mut s, "What is it indicated for?").await;

        assert_eq!(out.answer.fallback_reason, Some(FallbackReason::NoEvidence));
        assert!(out.answer.evidence.is_empty());
        assert!(out.path.contains(&Stage::Grade));
        assert!(!out.path.contains(&Stage::Generate));
        assert_eq!(s.turn(0).unwrap().graded.len(), 2);
    }

    #[tokio::test]
    async fn test_ambiguous_classification_is_off_topic() {
        let (orch, docs) = orchestrator(
            Err(CollaboratorError::ClassificationAmbiguous("maybe".into())),
            0.9,
            Duration::ZERO,
        );
        let mut s = session();
        let out = orch.run_turn(&mut s, "hmm").await;
        assert_eq!(out.answer.fallback_reason, Some(FallbackReason::OffTopic));
        assert_eq!(out.topic, Some(Topic::OffTopic));
        assert_eq!(docs.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_classifier_failure_is_system_fallback() {
        let (orch, _) = orchestrator(
            Err(CollaboratorError::InferenceUnavailable("down".into())),
            0.9,
            Duration::ZERO,
        );
        let mut s = session();
        let out = orch.run_turn(&mut s, "Dose of Repatha?").await;
        assert_eq!(
            out.answer.fallback_reason,
            Some(FallbackReason::SystemUnavailable)
        );
        assert_eq!(out.topic, None);
        assert_eq!(&out.path[..4], &[Stage::Start, Stage::Rewrite, Stage::Classify, Stage::Fallback]);
        assert_eq!(s.turn_count(), 1);
    }

    #[tokio::test]
    async fn test_retrieval_timeout_is_system_fallback() {
        let (orch, _) = orchestrator(Ok(Topic::Overview), 0.9, Duration::from_secs(2));
        let mut s = session();
        let out = orch.run_turn(&mut s, "Overview please").await;
        assert_eq!(
            out.answer.fallback_reason,
            Some(FallbackReason::SystemUnavailable)
        );
        assert!(out.path.contains(&Stage::Retrieve));
        assert!(!out.path.contains(&Stage::Grade));
    }

    #[tokio::test]
    async fn test_generation_timeout_is_system_fallback() {
        let orch = Orchestrator::new(
            Arc::new(Echo),
            Arc::new(Fixed(Ok(Topic::DrugInformation))),
            docs(),
            RelevanceGrader::new(Arc::new(Constant(0.9)), 0.5, 2, Duration::from_secs(1)),
            Arc::new(Stall(Duration::from_secs(5))),
            FallbackHandler::default(),
            short_deadline(),
        );
        let mut s = session();
        let out = orch.run_turn(&mut s, "Side effects of Repatha?").await;

        assert_eq!(
            out.answer.fallback_reason,
            Some(FallbackReason::SystemUnavailable)
        );
        assert!(out.answer.evidence.is_empty());
        assert_eq!(
            out.path,
            vec![
                Stage::Start,
                Stage::Rewrite,
                Stage::Classify,
                Stage::Retrieve,
                Stage::Grade,
                Stage::Generate,
                Stage::Fallback,
                Stage::Record,
                Stage::End
            ]
        );
        assert_eq!(s.turn_count(), 1);
        assert_eq!(s.turn(0).unwrap().graded.len(), 2);
    }

    #[tokio::test]
    async fn test_rewrite_timeout_is_system_fallback() {
        let retriever = docs();
        let orch = Orchestrator::new(
            Arc::new(Stall(Duration::from_secs(5))),
            Arc::new(Fixed(Ok(Topic::Overview))),
            retriever.clone(),
            RelevanceGrader::new(Arc::new(Constant(0.9)), 0.5, 2, Duration::from_secs(1)),
            Arc::new(Reply),
            FallbackHandler::default(),
            short_deadline(),
        );
        let mut s = session();
        let out = orch.run_turn(&mut s, "Overview please").await;

        assert_eq!(
            out.answer.fallback_reason,
            Some(FallbackReason::SystemUnavailable)
        );
        assert_eq!(out.topic, None);
        assert_eq!(
            out.path,
            vec![Stage::Start, Stage::Rewrite, Stage::Fallback, Stage::Record, Stage::End]
        );
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 0);
        assert_eq!(s.turn_count(), 1);
    }

    #[tokio::test]
    async fn test_classifier_timeout_is_system_fallback() {
        let orch = Orchestrator::new(
            Arc::new(Echo),
            Arc::new(Stall(Duration::from_secs(5))),
            docs(),
            RelevanceGrader::new(Arc::new(Constant(0.9)), 0.5, 2, Duration::from_secs(1)),
            Arc::new(Reply),
            FallbackHandler::default(),
            short_deadline(),
        );
        let mut s = session();
        let out = orch.run_turn(&mut s, "Overview please").await;

        assert_eq!(
            out.answer.fallback_reason,
            Some(FallbackReason::SystemUnavailable)
        );
        assert_eq!(
            out.path,
            vec![
                Stage::Start,
                Stage::Rewrite,
                Stage::Classify,
                Stage::Fallback,
                Stage::Record,
                Stage::End
            ]
        );
        assert_eq!(s.turn_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_turn_leaves_session_untouched() {
        let (orch, _) = orchestrator(Ok(Topic::Overview), 0.9, Duration::from_secs(2));
        let mut s = session();
        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), orch.run_turn(&mut s, "slow")).await;
        assert!(cancelled.is_err());
        assert_eq!(s.turn_count(), 0);
    }

    #[test]
    fn test_settings_from_config_cover_retries() {
        let mut config = MedragConfig::default();
        config.model.timeout_ms = 1_000;
        config.model.max_retries = 2;
        let s = OrchestratorSettings::from_config(&config);
        assert_eq!(s.k, 4);
        assert_eq!(s.inference_timeout, Duration::from_millis(3_000 + 12_800));
    }
}
