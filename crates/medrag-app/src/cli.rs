//! CLI argument definitions for the medrag binary.
//!
//! Priority resolution: CLI flags > `MEDRAG_*` env vars > config file > defaults.

use std::path::{Path, PathBuf};

use clap::Parser;

use medrag_core::MedragConfig;

/// medrag: ask questions about the medical case-study documents.
#[derive(Parser, Debug, Default)]
#[command(name = "medrag", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", env = "MEDRAG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Language model name (overrides MEDRAG_MODEL).
    #[arg(short = 'm', long = "model")]
    pub model: Option<String>,

    /// Model server base URL (overrides MEDRAG_MODEL_ENDPOINT).
    #[arg(long = "endpoint")]
    pub endpoint: Option<String>,

    /// Pre-chunked JSONL corpus (overrides MEDRAG_CORPUS).
    #[arg(long = "corpus")]
    pub corpus: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// User id; prompted for when omitted.
    #[arg(short = 'u', long = "user")]
    pub user: Option<String>,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag / MEDRAG_CONFIG > ~/.medrag/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        match self.config {
            Some(ref p) => p.clone(),
            None => default_config_path(),
        }
    }

    /// Apply explicit flags on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut MedragConfig) {
        if let Some(ref model) = self.model {
            config.model.model = model.clone();
        }
        if let Some(ref endpoint) = self.endpoint {
            config.model.endpoint = endpoint.clone();
        }
        if let Some(ref corpus) = self.corpus {
            config.retrieval.corpus_path = corpus.to_string_lossy().to_string();
        }
        if let Some(ref level) = self.log_level {
            config.general.log_level = level.clone();
        }
    }
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    let home = std::env::var("USERPROFILE").ok();
    #[cfg(not(target_os = "windows"))]
    let home = std::env::var("HOME").ok();
    home.map(PathBuf::from)
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    match home_dir() {
        Some(home) => home.join(".medrag").join("config.toml"),
        None => PathBuf::from("config.toml"),
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    expand_with(path, home_dir().as_deref())
}

fn expand_with(path: &str, home: Option<&Path>) -> PathBuf {
    let rest = path
        .strip_prefix("~/")
        .or_else(|| path.strip_prefix("~\\"));
    match (rest, home) {
        (Some(rest), Some(home)) => home.join(rest),
        (Some(rest), None) => PathBuf::from(".").join(rest),
        _ if path == "~" => home.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")),
        _ => PathBuf::from(path),
    }
}
