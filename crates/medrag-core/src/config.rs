use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MedragError, Result};

/// Environment variable overriding `model.model`.
pub const ENV_MODEL: &str = "MEDRAG_MODEL";
/// Environment variable overriding `model.endpoint`.
pub const ENV_MODEL_ENDPOINT: &str = "MEDRAG_MODEL_ENDPOINT";
/// Environment variable overriding `retrieval.corpus_path`.
pub const ENV_CORPUS: &str = "MEDRAG_CORPUS";

/// Top-level configuration, loaded once at process start.
///
/// Loaded from `~/.medrag/config.toml` by default. Every section falls back to
/// its defaults when omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MedragConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub grading: GradingConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub rewriter: RewriterConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

impl MedragConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MedragConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| MedragError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Apply `MEDRAG_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup(ENV_MODEL).filter(|v| !v.trim().is_empty()) {
            self.model.model = model;
        }
        if let Some(endpoint) = lookup(ENV_MODEL_ENDPOINT).filter(|v| !v.trim().is_empty()) {
            self.model.endpoint = endpoint;
        }
        if let Some(corpus) = lookup(ENV_CORPUS).filter(|v| !v.trim().is_empty()) {
            self.retrieval.corpus_path = corpus;
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.retrieval.k == 0 {
            return Err(MedragError::Config("retrieval.k must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.grading.relevance_cutoff) {
            return Err(MedragError::Config(format!(
                "grading.relevance_cutoff must be within [0, 1], got {}",
                self.grading.relevance_cutoff
            )));
        }
        if self.grading.max_concurrency == 0 {
            return Err(MedragError::Config(
                "grading.max_concurrency must be at least 1".into(),
            ));
        }
        if self.memory.short_term_window == 0 {
            return Err(MedragError::Config(
                "memory.short_term_window must be at least 1".into(),
            ));
        }
        if self.model.timeout_ms == 0 || self.retrieval.timeout_ms == 0 {
            return Err(MedragError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Language model endpoint and sampling options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the Ollama-compatible server.
    pub endpoint: String,
    /// Model name.
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    /// Maximum tokens to generate per call.
    pub max_tokens: u32,
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
    /// Extra attempts after a transient failure.
    pub max_retries: u32,
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
            temperature: 0.3,
            top_p: 0.9,
            max_tokens: 1080,
            timeout_ms: 60_000,
            max_retries: 1,
        }
    }
}

/// Retriever settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Pre-chunked corpus, one JSON chunk per line.
    pub corpus_path: String,
    /// Number of chunks requested per query.
    pub k: usize,
    /// Retrieval timeout in milliseconds.
    pub timeout_ms: u64,
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            corpus_path: "~/.medrag/corpus.jsonl".to_string(),
            k: 4,
            timeout_ms: 10_000,
        }
    }
}

/// Relevance grading settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingConfig {
    /// A document is relevant iff its score is at least this value.
    pub relevance_cutoff: f32,
    /// Documents graded concurrently.
    pub max_concurrency: usize,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            relevance_cutoff: 0.5,
            max_concurrency: 4,
        }
    }
}

/// Which classifier implementation to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierBackend {
    Keyword,
    #[default]
    Model,
}

/// Topic classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub backend: ClassifierBackend,
    /// Minimum keyword score a topic needs to win (keyword backend).
    pub min_score: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            backend: ClassifierBackend::default(),
            min_score: 1,
        }
    }
}

/// Which rewriter implementation to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriterBackend {
    #[default]
    Reference,
    Model,
}

/// Query rewriter settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriterConfig {
    pub backend: RewriterBackend,
}

/// Session memory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Turns kept verbatim in short-term memory.
    pub short_term_window: usize,
    /// Lines kept in the long-term summary.
    pub summary_max_entries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_window: 5,
            summary_max_entries: 20,
        }
    }
}

/// Feedback log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Append-only JSONL log.
    pub log_path: String,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            log_path: "~/.medrag/feedback_log.jsonl".to_string(),
        }
    }
}

/// Facts about the configured case-study corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// Named entities (drug names) that references can resolve to.
    pub entities: Vec<String>,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            entities: vec!["Repatha".to_string(), "Aimovig".to_string()],
        }
    }
}

/// Optional overrides for the fallback templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub off_topic: Option<String>,
    pub no_evidence: Option<String>,
    pub system_unavailable: Option<String>,
}

/// Chat input limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Maximum question length in characters.
    pub max_message_length: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_length: 2000,
        }
    }
}
