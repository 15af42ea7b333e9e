//! medrag application binary - composition root.
//!
//! Ties the medrag crates together into an interactive console:
//! 1. Load configuration from TOML, then env and flag overrides
//! 2. Load the pre-chunked corpus into the lexical index
//! 3. Build the turn pipeline (rewrite -> classify -> retrieve -> grade -> generate)
//! 4. Read questions from stdin and ask for a verdict after each answer

mod cli;

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};

use medrag_chat::{
    ChatError, ChatService, EntityVocabulary, FallbackHandler, GroundedGenerator,
    KeywordClassifier, ModelClassifier, ModelRewriter, ModelScorer, Orchestrator,
    OrchestratorSettings, QueryRewriter, ReferenceRewriter, RelevanceGrader, TopicClassifier,
    TurnOutcome,
};
use medrag_core::config::{ClassifierBackend, RewriterBackend};
use medrag_core::{MedragConfig, SessionId};
use medrag_feedback::{FeedbackSink, JsonlFeedbackSink, MemoryFeedbackSink};
use medrag_llm::{InferenceModel, OllamaModel};
use medrag_retrieval::CorpusRetriever;

use cli::{expand_home, CliArgs};

type InputLines = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Logging starts after config: its default level lives there.
    let config_path = args.resolve_config_path();
    let mut config = if config_path.exists() {
        MedragConfig::load(&config_path)?
    } else {
        MedragConfig::default()
    };
    config.apply_env_overrides();
    args.apply_overrides(&mut config);
    config.validate()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        config = %config_path.display(),
        model = %config.model.model,
        endpoint = %config.model.endpoint,
        "medrag starting"
    );

    let service = build_service(&config)?;

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    let user = match args.user {
        Some(user) if !user.trim().is_empty() => user.trim().to_string(),
        _ => match prompt(&mut lines, "User id: ").await? {
            Some(user) if !user.is_empty() => user,
            _ => {
                eprintln!("A user id is required.");
                return Ok(());
            }
        },
    };
    let session = SessionId::new(user);

    run_repl(&service, &session, &mut lines).await?;

    tracing::info!(session = %session, "medrag shutting down");
    Ok(())
}

/// Wire every collaborator from configuration.
fn build_service(config: &MedragConfig) -> Result<ChatService, Box<dyn std::error::Error>> {
    let model: Arc<dyn InferenceModel> = Arc::new(OllamaModel::new(&config.model)?);

    let corpus_path = expand_home(&config.retrieval.corpus_path);
    let retriever = CorpusRetriever::from_jsonl(&corpus_path)?;
    tracing::info!(path = %corpus_path.display(), chunks = retriever.len(), "Corpus loaded");

    let vocabulary = EntityVocabulary::new(&config.corpus.entities);

    let rewriter: Arc<dyn QueryRewriter> = match config.rewriter.backend {
        RewriterBackend::Reference => Arc::new(ReferenceRewriter::new(vocabulary.clone())),
        RewriterBackend::Model => Arc::new(ModelRewriter::new(model.clone(), vocabulary.clone())),
    };
    let classifier: Arc<dyn TopicClassifier> = match config.classifier.backend {
        ClassifierBackend::Keyword => Arc::new(KeywordClassifier::new(
            vocabulary,
            config.classifier.min_score,
        )),
        ClassifierBackend::Model => Arc::new(ModelClassifier::new(model.clone())),
    };

    let settings = OrchestratorSettings::from_config(config);
    let grader = RelevanceGrader::new(
        Arc::new(ModelScorer::new(model.clone())),
        config.grading.relevance_cutoff,
        config.grading.max_concurrency,
        settings.inference_timeout,
    );

    let orchestrator = Orchestrator::new(
        rewriter,
        classifier,
        Arc::new(retriever),
        grader,
        Arc::new(GroundedGenerator::new(model)),
        FallbackHandler::new(&config.fallback),
        settings,
    );

    let feedback: Arc<dyn FeedbackSink> = if config.feedback.log_path.trim().is_empty() {
        tracing::warn!("feedback.log_path is empty; feedback is kept in memory only");
        Arc::new(MemoryFeedbackSink::new())
    } else {
        let path = expand_home(&config.feedback.log_path);
        tracing::info!(path = %path.display(), "Feedback log");
        Arc::new(JsonlFeedbackSink::new(path))
    };

    Ok(ChatService::new(
        orchestrator,
        feedback,
        config.memory.clone(),
        &config.chat,
    ))
}

/// Question loop. Ends on EOF, an empty line, `quit` or `exit`.
async fn run_repl(
    service: &ChatService,
    session: &SessionId,
    lines: &mut InputLines,
) -> std::io::Result<()> {
    println!("Ask about the case-study documents. Empty line, 'quit' or 'exit' to leave.");
    loop {
        let question = match prompt(lines, "\nQuestion: ").await? {
            Some(q) => q,
            None => break,
        };
        if question.is_empty() || is_exit(&question) {
            break;
        }

        let outcome = match service.ask(session, &question).await {
            Ok(outcome) => outcome,
            Err(e @ (ChatError::EmptyMessage | ChatError::MessageTooLong(_))) => {
                println!("{e}");
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "Turn failed");
                println!("Sorry, something went wrong: {e}");
                continue;
            }
        };
        print_outcome(&outcome);

        let verdict = loop {
            match prompt(lines, "Was this answer helpful? (yes/no): ").await? {
                None => return Ok(()),
                Some(raw) => match parse_verdict(&raw) {
                    Some(v) => break v,
                    None => println!("Please answer yes or no."),
                },
            }
        };
        if let Err(e) = service
            .submit_feedback(session, outcome.turn_index, verdict)
            .await
        {
            println!("Warning: feedback not saved ({e}).");
        }
    }
    Ok(())
}

async fn prompt(lines: &mut InputLines, label: &str) -> std::io::Result<Option<String>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(label.as_bytes()).await?;
    stdout.flush().await?;
    Ok(lines.next_line().await?.map(|l| l.trim().to_string()))
}

fn print_outcome(outcome: &TurnOutcome) {
    println!("\n{}", outcome.answer.text);
    if !outcome.answer.evidence.is_empty() {
        let sources: Vec<&str> = outcome
            .answer
            .evidence
            .iter()
            .map(|g| g.document.id.as_str())
            .collect();
        println!("\nSources: {}", sources.join(", "));
    }
    tracing::debug!(
        turn = outcome.turn_index,
        rewritten = %outcome.rewritten.text,
        topic = ?outcome.topic,
        path = ?outcome.path,
        "Turn outcome"
    );
}

fn is_exit(input: &str) -> bool {
    input.eq_ignore_ascii_case("quit") || input.eq_ignore_ascii_case("exit")
}

/// Interpret a yes/no reply; anything else asks again.
fn parse_verdict(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdict() {
        assert_eq!(parse_verdict("yes"), Some(true));
        assert_eq!(parse_verdict(" Y "), Some(true));
        assert_eq!(parse_verdict("No"), Some(false));
        assert_eq!(parse_verdict("maybe"), None);
        assert_eq!(parse_verdict(""), None);
    }

    #[test]
    fn test_exit_words() {
        assert!(is_exit("quit"));
        assert!(is_exit("EXIT"));
        assert!(!is_exit("quit smoking drugs?"));
    }
}
