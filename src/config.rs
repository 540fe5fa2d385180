use crate::client::ApiKey;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PROMPT_PATH: &str = "./PROMPT.md";
const DEFAULT_OUTPUT_PATH: &str = "./OUTPUT.txt";
const DEFAULT_DECK_NAME: &str = "Default";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_API_BASE_URL: &str = "https://api.anthropic.com";

/// Extensions taken by the progress files written next to the output.
const RESERVED_OUTPUT_EXTENSIONS: [&str; 2] = ["partial", "progress"];

/// Configuration for one deck generation run.
///
/// Use [`Config::builder()`] to construct a new configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Text file with one item per line
    pub input_path: PathBuf,

    /// File with the content rules for card generation
    pub prompt_path: PathBuf,

    /// Deck file to write
    pub output_path: PathBuf,

    /// Anki deck the cards are imported into
    pub deck_name: String,

    /// Swap question and answer columns in the output
    pub reverse: bool,

    /// Cards requested for every item
    pub cards_per_item: usize,

    /// Items sent in one request
    pub batch_size: usize,

    /// Model identifier sent to the API
    pub model: String,

    /// Response token limit per request
    pub max_tokens: u32,

    /// HTTP timeout for one request
    pub request_timeout: Duration,

    /// API base URL, without the `/v1/messages` path
    pub api_base_url: String,

    /// API key; only required outside dry runs
    pub api_key: Option<ApiKey>,

    /// Print the requests instead of sending them
    pub dry_run: bool,

    /// Discard saved progress and start over
    pub fresh: bool,

    /// Append every request and response to this file
    pub api_log: Option<PathBuf>,

    /// Create backups of an existing output file
    pub backup_existing: bool,

    /// Retry bounds and backoff
    pub retry: RetryPolicy,
}

impl Config {
    /// Creates a new configuration builder.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use anki_gen::Config;
    ///
    /// let config = Config::builder()
    ///     .input_path("words.txt")
    ///     .deck_name("Spanish")
    ///     .batch_size(10)
    ///     .build()
    ///     .expect("valid configuration");
    /// ```
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Card or batch counts are zero
    /// - The deck name is empty or contains a tab or line break
    /// - Model or token limit are unset
    /// - A retry bound is zero
    /// - The output path would collide with a progress file
    /// - The prompt file doesn't exist
    pub fn validate(&self) -> Result<()> {
        if self.cards_per_item == 0 {
            return Err(Error::config("cards_per_item must be greater than 0"));
        }

        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be greater than 0"));
        }

        if self.deck_name.trim().is_empty() {
            return Err(Error::config("Deck name must not be empty"));
        }

        if self.deck_name.contains(['\t', '\n', '\r']) {
            return Err(Error::config(format!(
                "Deck name must not contain tabs or line breaks: {:?}",
                self.deck_name
            )));
        }

        if self.model.trim().is_empty() {
            return Err(Error::config("Model must not be empty"));
        }

        if self.max_tokens == 0 {
            return Err(Error::config("max_tokens must be greater than 0"));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::config("Request timeout must be greater than 0"));
        }

        self.retry.validate()?;

        let output_ext = self.output_path.extension().and_then(|e| e.to_str());
        if let Some(ext) = output_ext.filter(|e| {
            RESERVED_OUTPUT_EXTENSIONS
                .iter()
                .any(|reserved| e.eq_ignore_ascii_case(reserved))
        }) {
            return Err(Error::config(format!(
                "Output file must not use the .{ext} extension; it is reserved for progress files: {}",
                self.output_path.display()
            )));
        }

        if !self.prompt_path.exists() {
            return Err(Error::config(format!(
                "Prompt file does not exist: {}",
                self.prompt_path.display()
            )));
        }

        if !self.prompt_path.is_file() {
            return Err(Error::config(format!(
                "Prompt path is not a file: {}",
                self.prompt_path.display()
            )));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_path: PathBuf::new(),
            prompt_path: PathBuf::from(DEFAULT_PROMPT_PATH),
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            deck_name: DEFAULT_DECK_NAME.to_string(),
            reverse: false,
            cards_per_item: 1,
            batch_size: 1,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_key: None,
            dry_run: false,
            fresh: false,
            api_log: None,
            backup_existing: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Builder for creating a [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    input_path: Option<PathBuf>,
    prompt_path: Option<PathBuf>,
    output_path: Option<PathBuf>,
    deck_name: Option<String>,
    reverse: bool,
    cards_per_item: Option<usize>,
    batch_size: Option<usize>,
    model: Option<String>,
    max_tokens: Option<u32>,
    request_timeout: Option<Duration>,
    api_base_url: Option<String>,
    api_key: Option<ApiKey>,
    dry_run: bool,
    fresh: bool,
    api_log: Option<PathBuf>,
    backup_existing: Option<bool>,
    retry: Option<RetryPolicy>,
}

impl ConfigBuilder {
    /// Sets the input file.
    #[must_use]
    pub fn input_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_path = Some(path.into());
        self
    }

    /// Sets the content rules file.
    #[must_use]
    pub fn prompt_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.prompt_path = Some(path.into());
        self
    }

    /// Sets the deck file to write.
    ///
    /// Progress files are kept next to it.
    #[must_use]
    pub fn output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    /// Sets the deck name.
    #[must_use]
    pub fn deck_name(mut self, name: impl Into<String>) -> Self {
        self.deck_name = Some(name.into());
        self
    }

    /// Swaps question and answer columns.
    #[must_use]
    pub fn reverse(mut self, enabled: bool) -> Self {
        self.reverse = enabled;
        self
    }

    /// Sets the number of cards per item.
    #[must_use]
    pub fn cards_per_item(mut self, count: usize) -> Self {
        self.cards_per_item = Some(count);
        self
    }

    /// Sets the number of items per request.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Sets the model identifier.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the response token limit.
    #[must_use]
    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    /// Sets the HTTP timeout for one request.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the API base URL.
    #[must_use]
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    /// Sets the API key. Blank keys are ignored.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = ApiKey::new(key);
        self
    }

    /// Enables dry run mode (no API calls, no file writes).
    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Discards saved progress before the run.
    #[must_use]
    pub fn fresh(mut self, enabled: bool) -> Self {
        self.fresh = enabled;
        self
    }

    /// Logs every request and response to `path`.
    #[must_use]
    pub fn api_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.api_log = Some(path.into());
        self
    }

    /// Enables or disables backup creation.
    #[must_use]
    pub fn backup_existing(mut self, enabled: bool) -> Self {
        self.backup_existing = Some(enabled);
        self
    }

    /// Sets retry bounds and backoff.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn build(self) -> Result<Config> {
        let config = Config {
            input_path: self.input_path.unwrap_or_default(),
            prompt_path: self
                .prompt_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PROMPT_PATH)),
            output_path: self
                .output_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_PATH)),
            deck_name: self
                .deck_name
                .unwrap_or_else(|| DEFAULT_DECK_NAME.to_string()),
            reverse: self.reverse,
            cards_per_item: self.cards_per_item.unwrap_or(1),
            batch_size: self.batch_size.unwrap_or(1),
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            api_base_url: self
                .api_base_url
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            api_key: self.api_key,
            dry_run: self.dry_run,
            fresh: self.fresh,
            api_log: self.api_log,
            backup_existing: self.backup_existing.unwrap_or(true),
            retry: self.retry.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }
}
