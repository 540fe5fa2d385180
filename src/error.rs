use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error types for the anki-gen library.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// IO error with context about the file path.
    #[error("IO error accessing '{path}': {message}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Template rendering error.
    #[error("Failed to render template '{template}': {message}")]
    Template {
        /// Template name
        template: String,
        /// Error message
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration: {message}")]
    Config {
        /// Detailed error message
        message: String,
    },

    /// JSON serialization error.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
    },

    /// Input file does not exist or is not a readable file.
    #[error("Input file not found: '{path}'")]
    InputNotFound {
        /// Path that was requested
        path: PathBuf,
    },

    /// Input file contains no items after dropping blank and comment lines.
    #[error("No items found in '{path}'. Every line is blank or a '#' comment.")]
    EmptyInput {
        /// Path to the input file
        path: PathBuf,
    },

    /// No API key was supplied for a run that needs the API.
    #[error("API key not provided. Set ANTHROPIC_API_KEY or pass --api-key.")]
    MissingApiKey,

    /// Transport-level failure from the generation service.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Response did not satisfy the card contract.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Progress artifacts are unreadable or inconsistent.
    #[error("Invalid progress state in '{path}': {message}")]
    Progress {
        /// Progress artifact path
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// A batch exhausted its retries and the run was halted.
    #[error(
        "Batch of items {first_item}-{last_item} failed after {attempts} attempt(s): {source}. \
         Items up to {resume_after} are saved; rerun the same command to resume."
    )]
    BatchFailed {
        /// Position of the first item in the failed batch
        first_item: usize,
        /// Position of the last item in the failed batch
        last_item: usize,
        /// Number of requests issued for this batch
        attempts: usize,
        /// Last durably recorded item position
        resume_after: usize,
        /// The error that ended the batch
        source: Box<Error>,
    },
}

/// Errors returned by the generation service boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ApiError {
    /// HTTP 429 from the service.
    #[error("Rate limited by the API{}", retry_after_suffix(.retry_after))]
    RateLimited {
        /// Delay requested by the service, if any
        retry_after: Option<Duration>,
    },

    /// 5xx response from the service.
    #[error("API server error ({status}): {message}")]
    ServerError {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// The request did not complete within the client timeout.
    #[error("API request timed out")]
    Timeout,

    /// Any other failure; never retried.
    #[error("API request failed: {message}")]
    Other {
        /// Error message
        message: String,
    },
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    retry_after.map_or_else(String::new, |d| format!(" (retry after {}s)", d.as_secs()))
}

/// Contract violations found while validating a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// Response is not JSON or does not have the expected shape.
    #[error("Malformed response: {message}")]
    MalformedResponse {
        /// Parser or shape error
        message: String,
    },

    /// Batch response has the wrong number of item entries.
    #[error("Expected {expected} item entries, got {actual}")]
    ItemCountMismatch {
        /// Items in the batch
        expected: usize,
        /// Entries in the response
        actual: usize,
    },

    /// An item received the wrong number of cards.
    #[error("Item {item}: expected {expected} card(s), got {actual}")]
    CardCountMismatch {
        /// 1-based position of the item in the input
        item: usize,
        /// Configured cards per item
        expected: usize,
        /// Cards in the response
        actual: usize,
    },
}

impl Error {
    /// Creates an IO error with path context.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: source.to_string(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a template error.
    #[must_use]
    pub fn template(template: impl Into<String>, source: tera::Error) -> Self {
        // tera keeps the useful part of the message in the source chain
        let mut message = source.to_string();
        let mut cause = std::error::Error::source(&source);
        while let Some(inner) = cause {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            cause = inner.source();
        }
        Self::Template {
            template: template.into(),
            message,
        }
    }

    /// Creates a progress error.
    #[must_use]
    pub fn progress(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Progress {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an input-not-found error.
    #[must_use]
    pub fn input_not_found(path: impl Into<PathBuf>) -> Self {
        Self::InputNotFound { path: path.into() }
    }

    /// Creates an empty input error.
    #[must_use]
    pub fn empty_input(path: impl Into<PathBuf>) -> Self {
        Self::EmptyInput { path: path.into() }
    }

    /// Returns true if this is an IO error.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

impl ApiError {
    /// Creates an error that is never retried.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Short name of the error kind for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate-limited",
            Self::ServerError { .. } => "server-error",
            Self::Timeout => "timeout",
            Self::Other { .. } => "other",
        }
    }
}

impl ValidationError {
    /// Creates a malformed response error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    /// Short name of the error kind for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MalformedResponse { .. } => "malformed-response",
            Self::ItemCountMismatch { .. } => "item-count-mismatch",
            Self::CardCountMismatch { .. } => "card-count-mismatch",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<tera::Error> for Error {
    fn from(e: tera::Error) -> Self {
        Self::template("unknown", e)
    }
}
