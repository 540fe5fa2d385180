//! Boundary to the card generation service.
//!
//! The pipeline only sees [`CardGenerator`]: a system message and a user
//! message go in, raw response text or an [`ApiError`] comes out.
//! [`AnthropicClient`] implements it over the Messages API; any closure with
//! the right signature implements it too, which is how tests run offline.

use crate::{
    batcher::Batch,
    config::Config,
    error::{ApiError, Error, Result},
    prompt::SystemMessage,
};
use reqwest::{StatusCode, blocking::Client, header::HeaderMap};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, trace, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const LOGGED_RESPONSE_CHARS: usize = 5000;

/// One request to the generation service.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    /// Cached instructions and content rules
    pub system: &'a SystemMessage,

    /// Per-batch message
    pub user_message: &'a str,

    /// Items covered by this request
    pub batch: &'a Batch,
}

/// Generates raw card JSON for a request.
pub trait CardGenerator {
    /// Sends `request` and returns the model's raw text.
    ///
    /// # Errors
    ///
    /// Returns the transport failure; the caller decides whether to retry.
    fn generate(&self, request: &GenerationRequest<'_>) -> std::result::Result<String, ApiError>;
}

impl<F> CardGenerator for F
where
    F: Fn(&GenerationRequest<'_>) -> std::result::Result<String, ApiError>,
{
    fn generate(&self, request: &GenerationRequest<'_>) -> std::result::Result<String, ApiError> {
        self(request)
    }
}

/// API key that never shows up in logs or `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wraps a key; returns `None` for blank input.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into().trim().to_string();
        if key.is_empty() { None } else { Some(Self(key)) }
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: [SystemBlock<'a>; 1],
    messages: [UserMessage<'a>; 1],
}

#[derive(Serialize)]
struct SystemBlock<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

/// Blocking client for the Anthropic Messages API.
#[derive(Debug)]
pub struct AnthropicClient {
    http: Client,
    api_key: ApiKey,
    endpoint: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicClient {
    /// Creates a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingApiKey`] without a key, or a configuration
    /// error if the HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or(Error::MissingApiKey)?;

        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_key,
            endpoint: format!("{}/v1/messages", config.api_base_url.trim_end_matches('/')),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn body<'a>(&'a self, request: &GenerationRequest<'a>) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: [SystemBlock {
                kind: "text",
                text: &request.system.text,
                cache_control: request
                    .system
                    .cacheable
                    .then_some(CacheControl { kind: "ephemeral" }),
            }],
            messages: [UserMessage {
                role: "user",
                content: request.user_message,
            }],
        }
    }
}

impl CardGenerator for AnthropicClient {
    fn generate(&self, request: &GenerationRequest<'_>) -> std::result::Result<String, ApiError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", self.api_key.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.body(request))
            .send()
            .map_err(classify_transport_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().map_err(classify_transport_error)?;

        if !status.is_success() {
            return Err(classify_status(status, &headers, &body));
        }

        let parsed: MessagesResponse = serde_json::from_str(&body)
            .map_err(|e| ApiError::other(format!("Unexpected API response body: {e}")))?;

        if let Some(usage) = &parsed.usage {
            debug!(
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                cache_creation_tokens = usage.cache_creation_input_tokens.unwrap_or(0),
                cache_read_tokens = usage.cache_read_input_tokens.unwrap_or(0),
                "API usage"
            );
        }

        let text: String = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();

        if text.trim().is_empty() {
            return Err(ApiError::other("Empty response from API"));
        }

        trace!(raw_response = %text, "Raw model text");
        Ok(text)
    }
}

fn classify_transport_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::other(e.to_string())
    }
}

fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> ApiError {
    let message = api_error_message(body);
    match status.as_u16() {
        429 => ApiError::RateLimited {
            retry_after: retry_after(headers),
        },
        // 529 is the service's "overloaded" status
        code @ (500..=599) => ApiError::ServerError {
            status: code,
            message,
        },
        408 => ApiError::Timeout,
        code => ApiError::other(format!("HTTP {code}: {message}")),
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Pulls `error.message` out of an API error body, falling back to the raw body.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// Appends every exchange to a plain-text log file.
pub struct RequestLog<G> {
    inner: G,
    path: PathBuf,
    model: String,
}

impl<G: CardGenerator> RequestLog<G> {
    /// Wraps `inner`, logging to `path`.
    pub fn new(inner: G, path: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            inner,
            path: path.into(),
            model: model.into(),
        }
    }

    fn append(&self, request: &GenerationRequest<'_>, status: &str, response: &str) {
        let rule = "=".repeat(80);
        let thin = "-".repeat(80);
        let shown: String = response.chars().take(LOGGED_RESPONSE_CHARS).collect();
        let entry = format!(
            "{rule}\nTimestamp: {}\nStatus: {status}\nModel: {}\nItems: {}-{}\n{thin}\nUSER MESSAGE:\n{}\n{thin}\nRESPONSE:\n{shown}\n{rule}\n\n",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            self.model,
            request.batch.first_position(),
            request.batch.last_position(),
            request.user_message,
        );

        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(entry.as_bytes()));

        if let Err(e) = written {
            warn!("Failed to write request log {}: {}", self.path.display(), e);
        }
    }
}

impl<G: CardGenerator> CardGenerator for RequestLog<G> {
    fn generate(&self, request: &GenerationRequest<'_>) -> std::result::Result<String, ApiError> {
        let result = self.inner.generate(request);
        match &result {
            Ok(text) => self.append(request, "success", text),
            Err(e) => self.append(request, e.kind(), &e.to_string()),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Item;
    use assert_fs::prelude::*;
    use reqwest::header::{HeaderValue, RETRY_AFTER};

    fn system() -> SystemMessage {
        SystemMessage {
            text: "instructions".to_string(),
            cacheable: true,
        }
    }

    fn batch() -> Batch {
        Batch::new(vec![Item::new(3, "busy")]).unwrap()
    }

    #[test]
    fn test_closure_is_a_generator() {
        let generator =
            |req: &GenerationRequest<'_>| Ok::<_, ApiError>(format!("echo {}", req.user_message));
        let system = system();
        let batch = batch();
        let request = GenerationRequest {
            system: &system,
            user_message: "hi",
            batch: &batch,
        };

        assert_eq!(generator.generate(&request).unwrap(), "echo hi");
    }

    #[test]
    fn test_api_key_is_redacted() {
        let key = ApiKey::new("sk-secret").unwrap();
        assert_eq!(format!("{key:?}"), "ApiKey(***)");
        assert!(ApiKey::new("   ").is_none());
    }

    #[test]
    fn test_request_body_marks_system_cacheable() {
        let config = Config {
            api_key: ApiKey::new("k"),
            ..Config::default()
        };
        let client = AnthropicClient::from_config(&config).unwrap();
        let system = system();
        let batch = batch();
        let request = GenerationRequest {
            system: &system,
            user_message: "Generate 1 card for:\nbusy",
            batch: &batch,
        };

        let body = serde_json::to_value(client.body(&request)).unwrap();
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(body["system"][0]["text"], "instructions");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], 4096);
    }

    #[test]
    fn test_missing_key() {
        let config = Config::default();
        assert!(matches!(
            AnthropicClient::from_config(&config).unwrap_err(),
            Error::MissingApiKey
        ));
    }

    #[test]
    fn test_status_classification() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));

        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, ""),
            ApiError::RateLimited {
                retry_after: Some(Duration::from_secs(12))
            }
        );
        assert_eq!(
            classify_status(
                StatusCode::from_u16(529).unwrap(),
                &HeaderMap::new(),
                r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#
            ),
            ApiError::ServerError {
                status: 529,
                message: "Overloaded".to_string()
            }
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, &HeaderMap::new(), "bad"),
            ApiError::Other { .. }
        ));
    }

    #[test]
    fn test_request_log_appends_entries() {
        let temp = assert_fs::TempDir::new().unwrap();
        let log = temp.child("api.log");
        let inner = |_: &GenerationRequest<'_>| Ok::<_, ApiError>(r#"{"cards":[]}"#.to_string());
        let logged = RequestLog::new(inner, log.path(), "test-model");

        let system = system();
        let batch = batch();
        let request = GenerationRequest {
            system: &system,
            user_message: "Generate 1 card for:\nbusy",
            batch: &batch,
        };
        logged.generate(&request).unwrap();
        logged.generate(&request).unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.matches("Status: success").count(), 2);
        assert!(content.contains("Model: test-model"));
        assert!(content.contains("Items: 3-3"));
    }
}
