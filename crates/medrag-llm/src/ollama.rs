//! Ollama chat-completion client.
//!
//! Sends non-streaming `/api/chat` requests. Every attempt, response body
//! included, is bounded by the configured timeout. Transient failures
//! (timeouts, connection errors, HTTP 5xx) are retried with exponential
//! backoff up to `max_retries` extra attempts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use medrag_core::config::ModelConfig;
use medrag_core::{CollaboratorError, MedragError};

use crate::{InferenceModel, InferenceRequest, PromptMessage};

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Failure of a single attempt, before retry policy is applied.
#[derive(Debug)]
enum AttemptError {
    Timeout,
    /// Worth retrying: connection refused, 5xx.
    Transient(String),
    /// Not worth retrying: 4xx, undecodable body.
    Permanent(String),
}

/// [`InferenceModel`] backed by an Ollama server.
pub struct OllamaModel {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    timeout: Duration,
    max_retries: u32,
}

impl OllamaModel {
    pub fn new(config: &ModelConfig) -> Result<Self, MedragError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| MedragError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            timeout: config.timeout(),
            max_retries: config.max_retries,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.endpoint)
    }

    fn build_body<'a>(&'a self, request: &'a InferenceRequest) -> OllamaChatRequest<'a> {
        OllamaChatRequest {
            model: &self.model,
            messages: &request.messages,
            stream: false,
            options: ChatOptions {
                temperature: request.temperature.unwrap_or(self.temperature),
                top_p: self.top_p,
                num_predict: self.max_tokens,
            },
        }
    }

    async fn attempt(&self, request: &InferenceRequest) -> Result<String, AttemptError> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .unwrap_or(Err(AttemptError::Timeout))
    }

    /// One request/response round trip, body read included.
    async fn exchange(&self, request: &InferenceRequest) -> Result<String, AttemptError> {
        let body = self.build_body(request);
        let response = match self.client.post(self.chat_url()).json(&body).send().await {
            Err(e) if e.is_timeout() => return Err(AttemptError::Timeout),
            Err(e) => return Err(AttemptError::Transient(format!("request failed: {}", e))),
            Ok(response) => response,
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let msg = format!("Ollama API error: HTTP {} - {}", status, text);
            return Err(if status.is_server_error() {
                AttemptError::Transient(msg)
            } else {
                AttemptError::Permanent(msg)
            });
        }

        let parsed: OllamaChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                AttemptError::Timeout
            } else {
                AttemptError::Permanent(format!("undecodable response: {}", e))
            }
        })?;
        Ok(parsed.message.content.trim().to_string())
    }
}

#[async_trait]
impl InferenceModel for OllamaModel {
    async fn infer(&self, request: &InferenceRequest) -> Result<String, CollaboratorError> {
        let mut last_error = CollaboratorError::InferenceUnavailable("no attempt made".into());

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }

            match self.attempt(request).await {
                Ok(content) => {
                    debug!(model = %self.model, attempt, chars = content.len(), "Inference complete");
                    return Ok(content);
                }
                Err(AttemptError::Permanent(msg)) => {
                    return Err(CollaboratorError::InferenceUnavailable(msg));
                }
                Err(AttemptError::Timeout) => {
                    last_error = CollaboratorError::InferenceTimeout(self.timeout);
                }
                Err(AttemptError::Transient(msg)) => {
                    last_error = CollaboratorError::InferenceUnavailable(msg);
                }
            }

            if attempt < self.max_retries {
                warn!(
                    model = %self.model,
                    error = %last_error,
                    "Inference failed (attempt {}/{}), retrying",
                    attempt + 1,
                    self.max_retries + 1
                );
            }
        }

        Err(last_error)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Delay before retry number `attempt` (1-based).
fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(100 * (1u64 << attempt.min(6)))
}
