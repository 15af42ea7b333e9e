//! Retrieval over the case-study corpus.
//!
//! Defines the [`Retriever`] interface the orchestrator calls and a
//! corpus-backed implementation ranking pre-chunked documents with SQLite
//! FTS5 (BM25).

pub mod corpus;
pub mod fts;

use async_trait::async_trait;
use medrag_core::{CollaboratorError, RetrievedDocument};

pub use corpus::CorpusRetriever;
pub use fts::{FtsIndex, SearchHit};

/// Source of candidate chunks for a query.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return up to `k` chunks, best first.
    ///
    /// Fails with [`CollaboratorError::RetrievalUnavailable`] when the
    /// underlying index cannot be reached.
    async fn search(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedDocument>, CollaboratorError>;
}
