//! Generator types — provider-neutral challenge payloads and errors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::state::Difficulty;

// =============================================================================
// ERROR
// =============================================================================

/// Errors produced by the challenge generation client.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The required API key environment variable is not set.
    #[error("missing API key: env var {var} not set")]
    MissingApiKey { var: String },

    /// The HTTP request to the provider failed.
    #[error("generation request failed: {0}")]
    ApiRequest(String),

    /// The provider returned a non-success HTTP status.
    #[error("generation response error: status {status}")]
    ApiResponse { status: u16, body: String },

    /// The provider response body could not be deserialized.
    #[error("generation response parse failed: {0}")]
    ApiParse(String),

    /// The model produced text that is not a usable challenge.
    #[error("generated challenge invalid: {0}")]
    InvalidChallenge(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl crate::event::ErrorCode for LlmError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MissingApiKey { .. } => "E_MISSING_API_KEY",
            Self::ApiRequest(_) => "E_API_REQUEST",
            Self::ApiResponse { .. } => "E_API_RESPONSE",
            Self::ApiParse(_) => "E_API_PARSE",
            Self::InvalidChallenge(_) => "E_INVALID_CHALLENGE",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
        }
    }

    fn retryable(&self) -> bool {
        matches!(
            self,
            Self::ApiRequest(_) | Self::ApiResponse { status: 429 | 500..=599, .. } | Self::InvalidChallenge(_)
        )
    }
}

// =============================================================================
// GENERATED CHALLENGE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedExample {
    pub input: String,
    pub output: String,
}

/// A challenge as produced by the model, before the coordinator stamps an id,
/// difficulty, and topic onto it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedChallenge {
    pub title: String,
    pub description: String,
    pub examples: Vec<GeneratedExample>,
    /// Language name → starter source.
    #[serde(default)]
    pub template: HashMap<String, String>,
}

// =============================================================================
// GENERATION TRAIT
// =============================================================================

/// Provider-neutral async trait for challenge generation. Enables mocking in
/// tests; the coordinator treats the service as unreliable either way.
#[async_trait::async_trait]
pub trait GenerateChallenge: Send + Sync {
    /// Ask the external service for a fresh challenge.
    ///
    /// # Errors
    ///
    /// Returns an [`LlmError`] if the request fails, the response is
    /// malformed, or the model output is not a usable challenge.
    async fn generate(&self, difficulty: Difficulty, topic: &str) -> Result<GeneratedChallenge, LlmError>;
}

// =============================================================================
// MODEL OUTPUT PARSING
// =============================================================================

/// Parse the model's text output into a challenge. Tolerates markdown code
/// fences around the JSON object but nothing else.
///
/// # Errors
///
/// Returns [`LlmError::InvalidChallenge`] when the text carries no JSON
/// object, the JSON does not match the challenge shape, or required fields
/// are empty.
pub fn parse_challenge_text(text: &str) -> Result<GeneratedChallenge, LlmError> {
    let json = extract_json_object(text)
        .ok_or_else(|| LlmError::InvalidChallenge("no JSON object in model output".into()))?;

    let challenge: GeneratedChallenge =
        serde_json::from_str(json).map_err(|e| LlmError::InvalidChallenge(e.to_string()))?;

    if challenge.title.trim().is_empty() {
        return Err(LlmError::InvalidChallenge("title is empty".into()));
    }
    if challenge.description.trim().is_empty() {
        return Err(LlmError::InvalidChallenge("description is empty".into()));
    }
    if challenge.examples.is_empty() {
        return Err(LlmError::InvalidChallenge("no examples".into()));
    }

    Ok(challenge)
}

/// Slice out the outermost `{ ... }` from model text, skipping code fences.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
