//! Retriever backed by a pre-chunked corpus file.
//!
//! The ingestion step (PDF parsing and chunking) runs elsewhere and writes one
//! JSON chunk per line: `{"id": "...", "text": "...", "source": {"page": 3,
//! "section": "Dosage"}}`.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use medrag_core::{CollaboratorError, MedragError, RetrievedDocument};

use crate::fts::FtsIndex;
use crate::Retriever;

/// Retriever that ranks corpus chunks with FTS5 BM25.
#[derive(Debug)]
pub struct CorpusRetriever {
    index: FtsIndex,
}

impl CorpusRetriever {
    /// Build from already-loaded chunks.
    pub fn from_documents(
        documents: impl IntoIterator<Item = RetrievedDocument>,
    ) -> Result<Self, MedragError> {
        let index = FtsIndex::in_memory()?;
        for doc in documents {
            let inserted = index
                .insert(&doc)
                .map_err(|e| MedragError::Corpus(e.to_string()))?;
            if !inserted {
                warn!(id = %doc.id, "Duplicate chunk id skipped");
            }
        }
        if index.is_empty() {
            return Err(MedragError::Corpus("corpus contains no chunks".into()));
        }
        Ok(Self { index })
    }

    /// Load a JSONL corpus file.
    ///
    /// Blank lines are skipped. A malformed line fails the whole load and the
    /// error names the line number.
    pub fn from_jsonl(path: &Path) -> Result<Self, MedragError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MedragError::Corpus(format!("cannot read {}: {}", path.display(), e))
        })?;

        let mut docs = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let doc: RetrievedDocument = serde_json::from_str(line).map_err(|e| {
                MedragError::Corpus(format!("{}:{}: {}", path.display(), lineno + 1, e))
            })?;
            docs.push(doc);
        }

        let retriever = Self::from_documents(docs)?;
        info!(
            path = %path.display(),
            chunks = retriever.len(),
            "Corpus loaded"
        );
        Ok(retriever)
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[async_trait]
impl Retriever for CorpusRetriever {
    async fn search(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<RetrievedDocument>, CollaboratorError> {
        let hits = self.index.search(query, k)?;
        debug!(
            hits = hits.len(),
            top_score = hits.first().map(|h| h.score).unwrap_or(0.0),
            "Corpus search complete"
        );
        Ok(hits.into_iter().map(|h| h.document).collect())
    }
}
