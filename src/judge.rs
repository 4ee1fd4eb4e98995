//! Code execution — Judge0-compatible external collaborator.
//!
//! DESIGN
//! ======
//! The Challenge Coordinator runs each submission against every example test
//! case through this module. A run is submit-then-poll: `POST /submissions`
//! returns a token, `GET /submissions/{token}` is polled until the status
//! leaves the queued/processing states. Output comparison happens in the
//! coordinator, not here — the runner only reports stdout/stderr and the
//! terminal status. Non-2xx responses and poll timeouts are evaluation
//! failures (retryable), never submission rejections.

use std::time::Duration;

use serde::Deserialize;

// Judge0 terminal status ids. 1 and 2 are In Queue / Processing.
pub const STATUS_ACCEPTED: u32 = 3;
const LAST_NONTERMINAL_STATUS: u32 = 2;

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_MAX_POLLS: u32 = 40;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    /// `JUDGE0_URL` is not configured.
    #[error("execution service not configured: JUDGE0_URL not set")]
    NotConfigured,

    /// The HTTP request to the execution service failed.
    #[error("execution request failed: {0}")]
    ApiRequest(String),

    /// The execution service returned a non-success HTTP status.
    #[error("execution response error: status {status}")]
    ApiResponse { status: u16, body: String },

    /// The execution service response could not be deserialized.
    #[error("execution response parse failed: {0}")]
    ApiParse(String),

    /// The submission never reached a terminal status within the poll budget.
    #[error("execution timed out waiting for a terminal status")]
    PollTimeout,

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl crate::event::ErrorCode for JudgeError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotConfigured => "E_JUDGE_NOT_CONFIGURED",
            Self::ApiRequest(_) => "E_API_REQUEST",
            Self::ApiResponse { .. } => "E_API_RESPONSE",
            Self::ApiParse(_) => "E_API_PARSE",
            Self::PollTimeout => "E_POLL_TIMEOUT",
            Self::HttpClientBuild(_) => "E_HTTP_CLIENT_BUILD",
        }
    }

    fn retryable(&self) -> bool {
        matches!(
            self,
            Self::ApiRequest(_) | Self::ApiResponse { status: 429 | 500..=599, .. } | Self::PollTimeout
        )
    }
}

/// Terminal result of one execution run.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_output: Option<String>,
    pub time: Option<String>,
    pub memory: Option<u64>,
    pub status_id: u32,
    pub status_description: String,
}

impl ExecutionOutcome {
    /// True when the program ran to completion without the service flagging
    /// a runtime, compile, or limit error.
    #[must_use]
    pub fn ran_clean(&self) -> bool {
        self.status_id == STATUS_ACCEPTED
    }

    /// Best human-readable failure description for a non-clean run.
    #[must_use]
    pub fn failure_detail(&self) -> String {
        if let Some(compile) = self.compile_output.as_deref().filter(|s| !s.trim().is_empty()) {
            return compile.trim().to_string();
        }
        if let Some(stderr) = self.stderr.as_deref().filter(|s| !s.trim().is_empty()) {
            return stderr.trim().to_string();
        }
        self.status_description.clone()
    }
}

/// Async trait for running one program against one stdin. Mocked in tests.
#[async_trait::async_trait]
pub trait RunCode: Send + Sync {
    /// Submit and poll until terminal.
    ///
    /// # Errors
    ///
    /// Returns a [`JudgeError`] if the service is unreachable, rejects the
    /// request, or never reaches a terminal status.
    async fn run(&self, source: &str, language_id: u32, stdin: &str) -> Result<ExecutionOutcome, JudgeError>;
}

// =============================================================================
// LANGUAGE MAPPING
// =============================================================================

/// Map the client's language name to the Judge0 language id.
#[must_use]
pub fn language_id(language: &str) -> Option<u32> {
    match language {
        "javascript" => Some(63),
        "typescript" => Some(74),
        "python" => Some(71),
        "java" => Some(62),
        "cpp" => Some(54),
        "c" => Some(50),
        "csharp" => Some(51),
        "go" => Some(60),
        "rust" => Some(73),
        "ruby" => Some(72),
        _ => None,
    }
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct Judge0Client {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    poll_interval: Duration,
    max_polls: u32,
}

impl Judge0Client {
    /// Build an execution client from environment variables.
    ///
    /// Required:
    /// - `JUDGE0_URL`: base URL of a Judge0-compatible deployment
    ///
    /// Optional:
    /// - `JUDGE0_API_KEY`: sent as `X-RapidAPI-Key` when present
    /// - `JUDGE0_POLL_INTERVAL_MS`: default 500
    /// - `JUDGE0_MAX_POLLS`: default 40
    /// - `JUDGE0_REQUEST_TIMEOUT_SECS` / `JUDGE0_CONNECT_TIMEOUT_SECS`
    ///
    /// # Errors
    ///
    /// Returns [`JudgeError::NotConfigured`] when `JUDGE0_URL` is absent, or
    /// a build error if the HTTP client fails.
    pub fn from_env() -> Result<Self, JudgeError> {
        let base_url = std::env::var("JUDGE0_URL")
            .map_err(|_| JudgeError::NotConfigured)?
            .trim_end_matches('/')
            .to_string();
        let api_key = std::env::var("JUDGE0_API_KEY").ok();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(env_parse(
                "JUDGE0_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )))
            .connect_timeout(Duration::from_secs(env_parse(
                "JUDGE0_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )))
            .build()
            .map_err(|e| JudgeError::HttpClientBuild(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            api_key,
            poll_interval: Duration::from_millis(env_parse("JUDGE0_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)),
            max_polls: u32::try_from(env_parse("JUDGE0_MAX_POLLS", u64::from(DEFAULT_MAX_POLLS))).unwrap_or(DEFAULT_MAX_POLLS),
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("X-RapidAPI-Key", key),
            None => builder,
        }
    }

    async fn submit(&self, source: &str, language_id: u32, stdin: &str) -> Result<String, JudgeError> {
        let url = format!("{}/submissions?base64_encoded=false&wait=false", self.base_url);
        let body = serde_json::json!({
            "source_code": source,
            "language_id": language_id,
            "stdin": stdin,
        });

        let response = self
            .request(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| JudgeError::ApiRequest(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| JudgeError::ApiRequest(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(JudgeError::ApiResponse { status, body: text });
        }

        parse_token(&text)
    }

    async fn poll(&self, token: &str) -> Result<ExecutionOutcome, JudgeError> {
        let url = format!(
            "{}/submissions/{token}?base64_encoded=false&fields=stdout,stderr,compile_output,time,memory,status",
            self.base_url
        );

        for _ in 0..self.max_polls {
            let response = self
                .request(self.http.get(&url))
                .send()
                .await
                .map_err(|e| JudgeError::ApiRequest(e.to_string()))?;

            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .map_err(|e| JudgeError::ApiRequest(e.to_string()))?;

            if !(200..300).contains(&status) {
                return Err(JudgeError::ApiResponse { status, body: text });
            }

            if let Some(outcome) = parse_outcome(&text)? {
                return Ok(outcome);
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        Err(JudgeError::PollTimeout)
    }
}

#[async_trait::async_trait]
impl RunCode for Judge0Client {
    async fn run(&self, source: &str, language_id: u32, stdin: &str) -> Result<ExecutionOutcome, JudgeError> {
        let token = self.submit(source, language_id, stdin).await?;
        self.poll(&token).await
    }
}

fn env_parse(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

// =============================================================================
// WIRE TYPES + PARSING
// =============================================================================

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Deserialize)]
struct SubmissionResponse {
    stdout: Option<String>,
    stderr: Option<String>,
    compile_output: Option<String>,
    time: Option<String>,
    memory: Option<u64>,
    status: StatusField,
}

#[derive(Deserialize)]
struct StatusField {
    id: u32,
    #[serde(default)]
    description: String,
}

fn parse_token(json: &str) -> Result<String, JudgeError> {
    let parsed: TokenResponse = serde_json::from_str(json).map_err(|e| JudgeError::ApiParse(e.to_string()))?;
    Ok(parsed.token)
}

/// Parse one poll response. `Ok(None)` while the run is still queued or
/// processing.
fn parse_outcome(json: &str) -> Result<Option<ExecutionOutcome>, JudgeError> {
    let parsed: SubmissionResponse = serde_json::from_str(json).map_err(|e| JudgeError::ApiParse(e.to_string()))?;

    if parsed.status.id <= LAST_NONTERMINAL_STATUS {
        return Ok(None);
    }

    Ok(Some(ExecutionOutcome {
        stdout: parsed.stdout,
        stderr: parsed.stderr,
        compile_output: parsed.compile_output,
        time: parsed.time,
        memory: parsed.memory,
        status_id: parsed.status.id,
        status_description: parsed.status.description,
    }))
}

#[cfg(test)]
#[path = "judge_test.rs"]
mod tests;
