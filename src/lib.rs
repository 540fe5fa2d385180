//! # anki-gen
//!
//! Turns a plain-text list of items into an Anki flashcard deck by asking a
//! language model to write the cards.
//!
//! ## Features
//!
//! - Batched requests with a cached system message
//! - Strict response validation with bounded retries and backoff
//! - Resumable runs: progress is recorded after every batch
//! - Tab-separated output ready for Anki's import dialog
//!
//! ## Quick Start
//!
//! ```no_run
//! use anki_gen::{Config, Pipeline};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::builder()
//!     .input_path("words.txt")
//!     .prompt_path("PROMPT.md")
//!     .deck_name("Spanish")
//!     .cards_per_item(2)
//!     .batch_size(10)
//!     .build()?;
//!
//! Pipeline::new(config)?.run()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The library follows a pipeline architecture:
//! 1. **Reader**: Yields one item per non-blank, non-comment line
//! 2. **Batcher**: Groups items into fixed-size batches
//! 3. **Prompt**: Builds the system message and per-batch user messages
//! 4. **Retry**: Sends a batch and validates the answer until it succeeds
//! 5. **Progress**: Durably records every finished batch
//! 6. **Formatter**: Writes the deck file

#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(clippy::module_name_repetitions)]

mod batcher;
mod client;
mod config;
mod error;
mod formatter;
mod pipeline;
mod progress;
mod prompt;
mod reader;
mod retry;
mod validator;
mod writer;

pub use batcher::{Batch, Batcher};
pub use client::{AnthropicClient, ApiKey, CardGenerator, GenerationRequest, RequestLog};
pub use config::{Config, ConfigBuilder};
pub use error::{ApiError, Error, Result, ValidationError};
pub use formatter::{DECK_HEADER, DeckFormatter, escape_field};
pub use pipeline::{Pipeline, PipelineStats};
pub use progress::{ProgressRecorder, ResumeState};
pub use prompt::{PromptAssembler, SystemMessage};
pub use reader::{Item, LineReader, item_text};
pub use retry::{BatchOutcome, BatchState, RetryController, RetryPolicy};
pub use validator::{
    Card, CardField, GenerationResult, ResponseValidator, Validated, ValidationWarning,
};

/// Runs a complete deck generation with the given configuration.
///
/// This is the main entry point for the library.
///
/// # Errors
///
/// Returns an error if:
/// - Configuration is invalid or the API key is missing
/// - The input file doesn't exist or holds no items
/// - Saved progress doesn't match the input
/// - A batch runs out of retries
/// - File operations fail
///
/// # Examples
///
/// ```no_run
/// use anki_gen::{Config, run};
///
/// # fn main() -> anyhow::Result<()> {
/// let config = Config::builder()
///     .input_path("words.txt")
///     .dry_run(true)
///     .build()?;
///
/// run(config)?;
/// # Ok(())
/// # }
/// ```
pub fn run(config: Config) -> Result<PipelineStats> {
    Pipeline::new(config)?.run()
}
