//! Session memory.
//!
//! Each session keeps the last `short_term_window` turns verbatim. Turns
//! pushed out of the window are condensed to one line each and folded into a
//! long-term summary by [`MemorySummarizer`]. Stages only ever see a
//! [`MemoryView`] snapshot; the orchestrator appends to the session once per
//! turn, after the answer is final.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use medrag_core::config::MemoryConfig;
use medrag_core::{SessionId, Turn};

/// Characters of question or answer kept in a summary line.
const SUMMARY_SNIPPET_CHARS: usize = 120;

// =============================================================================
// MemorySummarizer
// =============================================================================

/// Long-term memory: condensed lines for evicted turns, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LongTermSummary {
    lines: VecDeque<String>,
    /// Lines dropped because the summary was full.
    omitted: usize,
}

impl LongTermSummary {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.omitted == 0
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn omitted(&self) -> usize {
        self.omitted
    }

    /// Render as text, one line per evicted turn.
    pub fn render(&self) -> String {
        let mut out = Vec::with_capacity(self.lines.len() + 1);
        if self.omitted > 0 {
            out.push(format!("({} earlier turns omitted)", self.omitted));
        }
        out.extend(self.lines.iter().cloned());
        out.join("\n")
    }
}

/// Folds evicted turns into a [`LongTermSummary`].
#[derive(Debug, Clone)]
pub struct MemorySummarizer {
    max_entries: usize,
}

impl MemorySummarizer {
    pub fn new(max_entries: usize) -> Self {
        Self { max_entries }
    }

    /// Append a condensed line for `turn`, dropping the oldest line when the
    /// summary is full.
    pub fn fold(&self, summary: &mut LongTermSummary, turn: &Turn) {
        summary.lines.push_back(Self::condense(turn));
        while summary.lines.len() > self.max_entries {
            summary.lines.pop_front();
            summary.omitted += 1;
        }
    }

    /// One-line digest of a turn.
    pub fn condense(turn: &Turn) -> String {
        let topic = turn.topic.map(|t| t.label()).unwrap_or("Unclassified");
        format!(
            "#{} [{}] Q: {} | A: {}",
            turn.index,
            topic,
            snippet(&turn.rewritten.text),
            snippet(&turn.answer.text)
        )
    }
}

fn snippet(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= SUMMARY_SNIPPET_CHARS {
        return flat;
    }
    let mut cut: String = flat.chars().take(SUMMARY_SNIPPET_CHARS).collect();
    cut.push_str("...");
    cut
}

// =============================================================================
// Session
// =============================================================================

/// Conversation state for one user.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    /// Short-term window, oldest first.
    turns: VecDeque<Turn>,
    summary: LongTermSummary,
    summarizer: MemorySummarizer,
    window: usize,
    next_index: usize,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, config: &MemoryConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            turns: VecDeque::with_capacity(config.short_term_window + 1),
            summary: LongTermSummary::default(),
            summarizer: MemorySummarizer::new(config.summary_max_entries),
            window: config.short_term_window.max(1),
            next_index: 0,
            created_at: now,
            last_active_at: now,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        self.last_active_at
    }

    /// Index the next appended turn will receive.
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// Number of turns ever recorded, including evicted ones.
    pub fn turn_count(&self) -> usize {
        self.next_index
    }

    /// Record a completed turn and return its index.
    ///
    /// The turn's `index` is overwritten with the session's counter. Turns
    /// falling out of the short-term window are folded into the summary.
    pub fn append(&mut self, mut turn: Turn) -> usize {
        let index = self.next_index;
        turn.index = index;
        self.next_index += 1;
        self.last_active_at = Utc::now();
        self.turns.push_back(turn);

        while self.turns.len() > self.window {
            if let Some(evicted) = self.turns.pop_front() {
                self.summarizer.fold(&mut self.summary, &evicted);
                debug!(session = %self.id, turn = evicted.index, "Turn folded into summary");
            }
        }
        index
    }

    /// Up to `n` turns from the short-term window, most recent first.
    pub fn recent_turns(&self, n: usize) -> Vec<&Turn> {
        self.turns.iter().rev().take(n).collect()
    }

    /// Short-term window, oldest first.
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// Long-term summary text. Empty until a turn has been evicted.
    pub fn summary(&self) -> String {
        self.summary.render()
    }

    pub fn long_term(&self) -> &LongTermSummary {
        &self.summary
    }

    /// A turn still held in the short-term window.
    pub fn turn(&self, index: usize) -> Option<&Turn> {
        self.turns.iter().find(|t| t.index == index)
    }

    pub fn turn_mut(&mut self, index: usize) -> Option<&mut Turn> {
        self.turns.iter_mut().find(|t| t.index == index)
    }

    /// Read-only snapshot handed to the pipeline stages.
    pub fn view(&self) -> MemoryView {
        MemoryView {
            recent: self.turns.iter().rev().cloned().collect(),
            summary: self.summary(),
        }
    }
}

// =============================================================================
// MemoryView
// =============================================================================

/// What a stage may know about the conversation so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryView {
    /// Most recent first.
    recent: Vec<Turn>,
    summary: String,
}

impl MemoryView {
    /// View of a session with no history.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from explicit parts. `recent` must be most-recent-first.
    pub fn new(recent: Vec<Turn>, summary: impl Into<String>) -> Self {
        Self {
            recent,
            summary: summary.into(),
        }
    }

    /// Short-term turns, most recent first.
    pub fn recent_turns(&self) -> &[Turn] {
        &self.recent
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty() && self.summary.is_empty()
    }
}

// =============================================================================
// SessionStore
// =============================================================================

/// Shared handle to one session. Holding the lock is the right to run a turn.
pub type SessionHandle = Arc<Mutex<Session>>;

/// All live sessions, keyed by user id.
pub struct SessionStore {
    sessions: StdMutex<HashMap<SessionId, SessionHandle>>,
    config: MemoryConfig,
}

impl SessionStore {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            sessions: StdMutex::new(HashMap::new()),
            config,
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Start a fresh session, replacing any existing one with the same id.
    pub fn create(&self, id: SessionId) -> SessionHandle {
        let handle = Arc::new(Mutex::new(Session::new(id.clone(), &self.config)));
        debug!(session = %id, "Session created");
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&handle));
        handle
    }

    pub fn get_or_create(&self, id: &SessionId) -> SessionHandle {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let config = &self.config;
        Arc::clone(sessions.entry(id.clone()).or_insert_with(|| {
            debug!(session = %id, "Session created");
            Arc::new(Mutex::new(Session::new(id.clone(), config)))
        }))
    }

    /// Drop a session. Returns false when it did not exist.
    pub fn remove(&self, id: &SessionId) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    /// Every live session, sorted by id.
    pub fn handles(&self) -> Vec<(SessionId, SessionHandle)> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = sessions
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use medrag_core::{Answer, FallbackReason, RewrittenQuery, Topic};

    fn config(window: usize, max_entries: usize) -> MemoryConfig {
        MemoryConfig {
            short_term_window: window,
            summary_max_entries: max_entries,
        }
    }

    fn turn(question: &str, answer: &str) -> Turn {
        Turn {
            index: usize::MAX,
            question: question.to_string(),
            rewritten: RewrittenQuery::unchanged(question),
            topic: Some(Topic::DrugInformation),
            graded: vec![],
            answer: Answer::fallback(answer, FallbackReason::NoEvidence),
            timestamp: Utc::now(),
            feedback: None,
        }
    }

    fn session(window: usize, max_entries: usize) -> Session {
        Session::new(SessionId::new("alice"), &config(window, max_entries))
    }

    // ---- Append / window ----

    #[test]
    fn test_append_assigns_sequential_indices() {
        let mut s = session(5, 20);
        assert_eq!(s.append(turn("q0", "a0")), 0);
        assert_eq!(s.append(turn("q1", "a1")), 1);
        assert_eq!(s.next_index(), 2);
        assert_eq!(s.turn(1).unwrap().question, "q1");
    }

    #[test]
    fn test_recent_turns_most_recent_first() {
        let mut s = session(5, 20);
        for i in 0..3 {
            s.append(turn(&format!("q{}", i), "a"));
        }
        let recent: Vec<&str> = s.recent_turns(2).iter().map(|t| t.question.as_str()).collect();
        assert_eq!(recent, vec!["q2", "q1"]);
        assert_eq!(s.recent_turns(10).len(), 3);
    }

    #[test]
    fn test_window_bound_and_eviction_into_summary() {
        let mut s = session(3, 20);
        assert!(s.summary().is_empty());
        for i in 0..5 {
            s.append(turn(&format!("question {}", i), &format!("answer {}", i)));
        }

        assert_eq!(s.recent_turns(usize::MAX).len(), 3);
        assert_eq!(s.turn_count(), 5);
        assert!(s.turn(0).is_none());
        assert!(s.turn(1).is_none());
        assert!(s.turn(2).is_some());

        let summary = s.summary();
        assert_eq!(summary.lines().count(), 2);
        assert!(summary.contains("question 0"));
        assert!(summary.contains("answer 1"));
        assert!(!summary.contains("question 2"));
    }

    #[test]
    fn test_summary_caps_entries_and_counts_omitted() {
        let mut s = session(1, 2);
        for i in 0..6 {
            s.append(turn(&format!("q{}", i), "a"));
        }
        // Five evicted, two kept, three omitted.
        assert_eq!(s.long_term().len(), 2);
        assert_eq!(s.long_term().omitted(), 3);
        let summary = s.summary();
        assert!(summary.starts_with("(3 earlier turns omitted)"));
        assert!(summary.contains("#3"));
        assert!(summary.contains("#4"));
        assert!(!summary.contains("#2 "));
    }

    #[test]
    fn test_turn_mut_updates_feedback() {
        let mut s = session(5, 20);
        let idx = s.append(turn("q", "a"));
        s.turn_mut(idx).unwrap().feedback = Some(true);
        assert_eq!(s.turn(idx).unwrap().feedback, Some(true));
    }

    // ---- Summarizer ----

    #[test]
    fn test_condense_flattens_and_truncates() {
        let long_answer = format!("line one\n\nline two {}", "x".repeat(300));
        let mut t = turn("What is Repatha?", &long_answer);
        t.index = 4;
        let line = MemorySummarizer::condense(&t);
        assert!(!line.contains('\n'));
        assert!(line.starts_with("#4 [Drug Information] Q: What is Repatha?"));
        assert!(line.ends_with("..."));
    }

    #[test]
    fn test_condense_unclassified_turn() {
        let mut t = turn("q", "a");
        t.topic = None;
        assert!(MemorySummarizer::condense(&t).contains("[Unclassified]"));
    }

    // ---- View ----

    #[test]
    fn test_view_is_a_snapshot() {
        let mut s = session(5, 20);
        s.append(turn("q0", "a0"));
        let view = s.view();
        s.append(turn("q1", "a1"));
        assert_eq!(view.recent_turns().len(), 1);
        assert_eq!(view.recent_turns()[0].question, "q0");
        assert!(MemoryView::empty().is_empty());
    }

    // ---- Store ----

    #[tokio::test]
    async fn test_store_get_or_create_reuses_session() {
        let store = SessionStore::new(MemoryConfig::default());
        let id = SessionId::new("alice");
        assert!(store.get(&id).is_none());

        let first = store.get_or_create(&id);
        first.lock().await.append(turn("q", "a"));
        let second = store.get_or_create(&id);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().await.turn_count(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_store_create_replaces_and_remove() {
        let store = SessionStore::new(MemoryConfig::default());
        let id = SessionId::new("bob");
        store.get_or_create(&id).lock().await.append(turn("q", "a"));

        let fresh = store.create(id.clone());
        assert_eq!(fresh.lock().await.turn_count(), 0);

        assert!(store.remove(&id));
        assert!(!store.remove(&id));
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_handles_sorted() {
        let store = SessionStore::new(MemoryConfig::default());
        store.create(SessionId::new("zoe"));
        store.create(SessionId::new("adam"));
        let ids: Vec<String> = store
            .handles()
            .into_iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(ids, vec!["adam", "zoe"]);
    }
}
