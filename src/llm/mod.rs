//! Challenge generation — LLM-backed external collaborator.
//!
//! DESIGN
//! ======
//! The Challenge Coordinator asks this module for a fresh coding problem
//! given a difficulty and topic. The concrete client is a thin wrapper over
//! the Anthropic Messages API: one request, strict-JSON prompt, pure parsing
//! in `types::parse_challenge_text` for testability. The service is treated
//! as unreliable — every failure maps to an [`LlmError`] the coordinator
//! surfaces as `ai-generation-failed` without touching room state.

pub mod types;

use std::time::Duration;

pub use types::{GenerateChallenge, GeneratedChallenge, GeneratedExample, LlmError};

use crate::state::Difficulty;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const DEFAULT_MAX_TOKENS: u32 = 2048;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// CLIENT
// =============================================================================

#[derive(Debug)]
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicClient {
    /// Build a generation client from environment variables.
    ///
    /// Required:
    /// - `LLM_API_KEY_ENV`: names the env var containing the API key
    ///
    /// Optional:
    /// - `LLM_MODEL`: provider default when absent
    /// - `LLM_MAX_TOKENS`: default 2048
    /// - `LLM_REQUEST_TIMEOUT_SECS`: default 60
    /// - `LLM_CONNECT_TIMEOUT_SECS`: default 10
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is missing or the HTTP client fails
    /// to build.
    pub fn from_env() -> Result<Self, LlmError> {
        let key_var =
            std::env::var("LLM_API_KEY_ENV").map_err(|_| LlmError::MissingApiKey { var: "LLM_API_KEY_ENV".into() })?;
        let api_key = std::env::var(&key_var).map_err(|_| LlmError::MissingApiKey { var: key_var.clone() })?;
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let max_tokens = env_parse_u32("LLM_MAX_TOKENS", DEFAULT_MAX_TOKENS);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(env_parse_u64(
                "LLM_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )))
            .connect_timeout(Duration::from_secs(env_parse_u64(
                "LLM_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )))
            .build()
            .map_err(|e| LlmError::HttpClientBuild(e.to_string()))?;

        Ok(Self { http, api_key, model, max_tokens })
    }

    /// Return the configured model name.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

fn env_parse_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_parse_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

#[async_trait::async_trait]
impl GenerateChallenge for AnthropicClient {
    async fn generate(&self, difficulty: Difficulty, topic: &str) -> Result<GeneratedChallenge, LlmError> {
        let difficulty_word = match difficulty {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        };
        let user = format!("Generate a {difficulty_word} coding challenge about: {topic}");
        let body = ApiRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: SYSTEM_PROMPT,
            messages: &[ApiMessage { role: "user", content: &user }],
        };

        let response = self
            .http
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ApiRequest(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::ApiRequest(e.to_string()))?;

        if status != 200 {
            return Err(LlmError::ApiResponse { status, body: text });
        }

        let model_text = parse_response_text(&text)?;
        types::parse_challenge_text(&model_text)
    }
}

const SYSTEM_PROMPT: &str = "You generate DSA coding challenges for a competitive practice room.\n\
    Respond with a single JSON object and nothing else, with fields:\n\
    - \"title\": short problem name\n\
    - \"description\": full problem statement including input/output format\n\
    - \"examples\": array of {\"input\": string, \"output\": string} — concrete stdin/stdout pairs,\n\
      at least 3, solvable by reading stdin and printing to stdout\n\
    - \"template\": object mapping language names (javascript, python, java, cpp) to starter code\n\
    The expected output must match the program's stdout exactly, modulo trailing whitespace.";

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(serde::Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [ApiMessage<'a>],
}

#[derive(serde::Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(serde::Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
}

#[derive(serde::Deserialize)]
#[serde(tag = "type")]
enum ApiContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Unknown,
}

// =============================================================================
// PARSING
// =============================================================================

/// Collect the text blocks of a Messages API response into one string.
fn parse_response_text(json: &str) -> Result<String, LlmError> {
    let api: ApiResponse = serde_json::from_str(json).map_err(|e| LlmError::ApiParse(e.to_string()))?;

    let parts: Vec<String> = api
        .content
        .into_iter()
        .filter_map(|block| match block {
            ApiContentBlock::Text { text } => Some(text),
            ApiContentBlock::Unknown => None,
        })
        .collect();

    if parts.is_empty() {
        return Err(LlmError::ApiParse("response carried no text blocks".into()));
    }
    Ok(parts.join("\n"))
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
