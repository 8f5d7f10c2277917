//! LLM abstract extraction.
//!
//! Page HTML is reduced to visible text, cut to `max_page_chars` and sent with
//! the partial abstract to an OpenAI-compatible chat completions endpoint.

use crate::config::LlmConfig;
use crate::error::{PubfillError, Result};
use crate::html;
use crate::prompts::abstract_extract::{build_user_prompt, SYSTEM_PROMPT};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Answers containing any of these are treated as a refusal.
const REFUSAL_MARKERS: &[&str] = &["I'm sorry", "I'm unable", "I am unable", "抱歉"];

/// Extraction failure. All variants move the record to the next fallback stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("LLM query failed: {0}")]
    Query(String),
    #[error("LLM refused: {0}")]
    Refusal(String),
    #[error("LLM timed out")]
    Timeout,
}

/// Completes a partial abstract from page content.
#[async_trait]
pub trait AbstractExtractor: Send + Sync {
    async fn extract(&self, snippet: &str, page: &str) -> std::result::Result<String, ExtractError>;
}

/// OpenAI-compatible API response structures
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions backed extractor.
pub struct LlmExtractor {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmExtractor {
    pub fn new(config: LlmConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PubfillError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    async fn ask(&self, user_prompt: String) -> std::result::Result<String, ExtractError> {
        let request_body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt}
            ],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens
        });

        let api_url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&api_url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExtractError::Timeout
                } else {
                    ExtractError::Query(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ExtractError::Query(format!("{} - {}", status, error_text)));
        }

        let api_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ExtractError::Query(format!("Failed to parse LLM response: {}", e)))?;

        Ok(api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[async_trait]
impl AbstractExtractor for LlmExtractor {
    async fn extract(&self, snippet: &str, page: &str) -> std::result::Result<String, ExtractError> {
        let text = html::visible_text(page);
        let text = html::truncate_chars(&text, self.config.max_page_chars);
        debug!(
            chars = text.len(),
            model = %self.config.model,
            "Sending extraction request"
        );

        let answer = self.ask(build_user_prompt(snippet, text)).await?;
        classify_answer(answer)
    }
}

/// Empty answers and refusals are failures; anything else is the abstract.
pub fn classify_answer(answer: String) -> std::result::Result<String, ExtractError> {
    let trimmed = answer.trim();
    if trimmed.is_empty() {
        return Err(ExtractError::Refusal("empty answer".into()));
    }
    if REFUSAL_MARKERS.iter().any(|m| trimmed.contains(m)) {
        let preview: String = trimmed.chars().take(120).collect();
        return Err(ExtractError::Refusal(preview));
    }
    Ok(trimmed.to_string())
}
