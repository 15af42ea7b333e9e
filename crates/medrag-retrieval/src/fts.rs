//! Full-text chunk index using SQLite FTS5.
//!
//! Chunks live in an in-memory database: a `chunks` table holding the
//! document fields and a `chunks_fts` virtual table over the text, ranked
//! by FTS5's built-in BM25. The connection sits behind a Mutex since
//! rusqlite's Connection is not Sync.

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use medrag_core::{CollaboratorError, MedragError, RetrievedDocument, SourceMetadata};

/// Words too common to help ranking. Dropped before building the MATCH
/// expression so a question like "what is it?" does not match every chunk.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "how", "in", "is", "it",
    "its", "of", "on", "or", "that", "the", "this", "to", "was", "what", "when", "which", "who",
    "with",
];

const SCHEMA: &str = "
    CREATE TABLE chunks (
        seq     INTEGER PRIMARY KEY,
        id      TEXT NOT NULL UNIQUE,
        text    TEXT NOT NULL,
        page    INTEGER,
        section TEXT
    );
    CREATE VIRTUAL TABLE chunks_fts USING fts5(
        text,
        content = 'chunks',
        content_rowid = 'seq',
        tokenize = 'porter unicode61'
    );
";

/// A single hit returned from a search.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub document: RetrievedDocument,
    /// BM25 relevance (FTS5 rank negated, higher = more relevant).
    pub score: f64,
}

/// In-memory FTS5 index over corpus chunks.
pub struct FtsIndex {
    conn: Mutex<Connection>,
}

impl FtsIndex {
    /// Open an empty in-memory index.
    pub fn in_memory() -> Result<Self, MedragError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| MedragError::Corpus(format!("Failed to open in-memory db: {}", e)))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| MedragError::Corpus(format!("Failed to create FTS5 tables: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, CollaboratorError>
    where
        F: FnOnce(&Connection) -> Result<T, CollaboratorError>,
    {
        let conn = self.conn.lock().map_err(|e| {
            CollaboratorError::RetrievalUnavailable(format!("Index lock poisoned: {}", e))
        })?;
        f(&conn)
    }

    /// Add a chunk. A chunk whose id is already indexed is skipped and
    /// `false` is returned.
    pub fn insert(&self, document: &RetrievedDocument) -> Result<bool, CollaboratorError> {
        self.with_conn(|conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO chunks (id, text, page, section)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        document.id,
                        document.text,
                        document.source.page,
                        document.source.section
                    ],
                )
                .map_err(unavailable)?;
            if inserted == 0 {
                return Ok(false);
            }
            conn.execute(
                "INSERT INTO chunks_fts (rowid, text) VALUES (?1, ?2)",
                params![conn.last_insert_rowid(), document.text],
            )
            .map_err(unavailable)?;
            Ok(true)
        })
    }

    /// Return the `k` best-ranked chunks for a free-text question.
    ///
    /// Chunks sharing no term with the question are never returned. Equal
    /// ranks keep insertion order.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, CollaboratorError> {
        let Some(expression) = match_expression(query) else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT c.id, c.text, c.page, c.section, chunks_fts.rank
                     FROM chunks_fts
                     JOIN chunks c ON c.seq = chunks_fts.rowid
                     WHERE chunks_fts MATCH ?1
                     ORDER BY chunks_fts.rank, c.seq
                     LIMIT ?2",
                )
                .map_err(unavailable)?;

            let rows = stmt
                .query_map(params![expression, k as i64], |row| {
                    let rank: f64 = row.get(4)?;
                    Ok(SearchHit {
                        document: RetrievedDocument {
                            id: row.get(0)?,
                            text: row.get(1)?,
                            source: SourceMetadata {
                                page: row.get(2)?,
                                section: row.get(3)?,
                            },
                        },
                        // FTS5 rank is negative (lower = better), negate for consistency.
                        score: -rank,
                    })
                })
                .map_err(unavailable)?;

            rows.collect::<Result<Vec<_>, _>>().map_err(unavailable)
        })
    }

    /// Fetch one chunk by id.
    pub fn get(&self, id: &str) -> Result<Option<RetrievedDocument>, CollaboratorError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, text, page, section FROM chunks WHERE id = ?1",
                params![id],
                |row| {
                    Ok(RetrievedDocument {
                        id: row.get(0)?,
                        text: row.get(1)?,
                        source: SourceMetadata {
                            page: row.get(2)?,
                            section: row.get(3)?,
                        },
                    })
                },
            )
            .optional()
            .map_err(unavailable)
        })
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get::<_, i64>(0))
                .map_err(unavailable)
        })
        .map(|n| n as usize)
        .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for FtsIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtsIndex").finish()
    }
}

fn unavailable(e: rusqlite::Error) -> CollaboratorError {
    CollaboratorError::RetrievalUnavailable(format!("FTS5 query failed: {}", e))
}

/// Turn a free-text question into an FTS5 MATCH expression.
///
/// Each remaining term is quoted so punctuation in the question can never
/// become FTS5 syntax; terms are OR-ed so partial matches still rank.
/// Returns `None` when nothing searchable is left.
pub(crate) fn match_expression(query: &str) -> Option<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in query.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        let word = word.to_lowercase();
        if STOPWORDS.contains(&word.as_str()) || terms.contains(&word) {
            continue;
        }
        terms.push(word);
    }
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}
