//! Conversational question answering over the case-study corpus.
//!
//! A turn runs through the stage graph in [`graph`]: the question is
//! rewritten against session memory, classified into a [`Topic`], answered
//! from graded evidence or routed to the fallback handler, and finally
//! recorded in the session. [`ChatService`] is the entry point for callers.
//!
//! [`Topic`]: medrag_core::Topic

pub mod classifier;
pub mod error;
pub mod fallback;
pub mod generator;
pub mod grader;
pub mod graph;
pub mod memory;
pub mod orchestrator;
pub mod rewriter;
pub mod service;

pub use classifier::{KeywordClassifier, ModelClassifier, TopicClassifier};
pub use error::ChatError;
pub use fallback::FallbackHandler;
pub use generator::{AnswerGenerator, GroundedGenerator};
pub use grader::{DocumentScorer, ModelScorer, RelevanceGrader};
pub use graph::Stage;
pub use memory::{MemorySummarizer, MemoryView, Session, SessionStore};
pub use orchestrator::{Orchestrator, OrchestratorSettings, TurnOutcome};
pub use rewriter::{EntityVocabulary, ModelRewriter, QueryRewriter, ReferenceRewriter};
pub use service::{ChatService, SessionSummary};
