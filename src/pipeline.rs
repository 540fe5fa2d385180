use crate::{
    batcher::{Batch, Batcher},
    client::{AnthropicClient, CardGenerator, RequestLog},
    config::Config,
    error::{Error, Result},
    formatter::DeckFormatter,
    progress::ProgressRecorder,
    prompt::PromptAssembler,
    reader::{Item, LineReader},
    retry::{BatchOutcome, RetryController},
    validator::ResponseValidator,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

const SYSTEM_PREVIEW_CHARS: usize = 500;

/// Statistics collected during one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    /// Items read from the input file
    pub total_items: usize,

    /// Items taken from saved progress
    pub resumed_items: usize,

    /// Items generated in this run
    pub processed_items: usize,

    /// Cards written to the deck
    pub total_cards: usize,

    /// Batches completed in this run, including halves of split batches
    pub batches: usize,

    /// Requests sent to the API
    pub requests: usize,

    /// Requests repeated after a failure, plus batch splits
    pub retries: usize,

    /// Empty-field warnings raised by validation
    pub warnings: usize,

    /// Total execution time
    pub duration: Duration,

    /// Deck file path
    pub output_path: String,

    /// Nothing was sent or written
    pub dry_run: bool,
}

impl PipelineStats {
    /// Prints a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║               Deck Generation Summary                 ║");
        println!("╠═══════════════════════════════════════════════════════╣");
        println!(
            "║ Items:                {:>8}                        ║",
            self.total_items
        );
        println!(
            "║   - Resumed:          {:>8}                        ║",
            self.resumed_items
        );
        println!(
            "║   - Processed:        {:>8}                        ║",
            self.processed_items
        );
        println!("║                                                       ║");
        println!(
            "║ Batches:              {:>8}                        ║",
            self.batches
        );
        println!(
            "║ API Requests:         {:>8}                        ║",
            self.requests
        );
        println!(
            "║ Retries:              {:>8}                        ║",
            self.retries
        );
        println!(
            "║ Warnings:             {:>8}                        ║",
            self.warnings
        );
        println!("║                                                       ║");
        println!(
            "║ Cards Written:        {:>8}                        ║",
            self.total_cards
        );
        println!("║ Output File:                                          ║");
        println!("║   {:<52}║", self.output_path);
        println!(
            "║ Total Time:           {:>8.2}s                       ║",
            self.duration.as_secs_f64()
        );
        if self.dry_run {
            println!("║                                                       ║");
            println!("║ ⚠ Dry run: no requests sent, no files written         ║");
        }
        println!("╚═══════════════════════════════════════════════════════╝\n");
    }
}

/// Drives a run from input file to deck file.
pub struct Pipeline {
    config: Config,
    generator: Option<Box<dyn CardGenerator>>,
}

impl Pipeline {
    /// Creates a pipeline that talks to the Anthropic API.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration validation fails
    /// - No API key is configured outside a dry run
    /// - The HTTP client cannot be built
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let generator: Option<Box<dyn CardGenerator>> = if config.dry_run {
            None
        } else {
            let client = AnthropicClient::from_config(&config)?;
            let generator: Box<dyn CardGenerator> = match &config.api_log {
                Some(path) => Box::new(RequestLog::new(client, path, config.model.as_str())),
                None => Box::new(client),
            };
            Some(generator)
        };

        Ok(Self { config, generator })
    }

    /// Creates a pipeline around any [`CardGenerator`].
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails.
    pub fn with_generator(config: Config, generator: impl CardGenerator + 'static) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            generator: Some(Box::new(generator)),
        })
    }

    /// Executes the run and returns statistics.
    ///
    /// # Process
    ///
    /// 1. **Read**: Loads items and the content rules
    /// 2. **Resume**: Picks up saved progress unless `fresh` is set
    /// 3. **Generate**: Sends batches in order, recording each one durably
    /// 4. **Write**: Renders the deck and removes the progress files
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchFailed`] when a batch runs out of retries; the
    /// progress files are left in place so the same command resumes.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use anki_gen::{Config, Pipeline};
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::builder()
    ///     .input_path("words.txt")
    ///     .api_key("sk-ant-...")
    ///     .build()?;
    ///
    /// let stats = Pipeline::new(config)?.run()?;
    /// stats.print_summary();
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip(self), fields(input = %self.config.input_path.display()))]
    pub fn run(self) -> Result<PipelineStats> {
        let start_time = Instant::now();

        let items = LineReader::read_all(&self.config.input_path)?;
        let assembler = PromptAssembler::from_config(&self.config)?;
        info!(
            "Found {} items in {} batch(es) in {}",
            items.len(),
            Batcher::batch_count(items.len(), self.config.batch_size),
            self.config.input_path.display()
        );

        let mut stats = PipelineStats {
            total_items: items.len(),
            output_path: self.config.output_path.display().to_string(),
            dry_run: self.config.dry_run,
            ..PipelineStats::default()
        };

        if self.config.dry_run {
            warn!("Dry run mode enabled - no requests will be sent");
            stats.batches = self.print_dry_run(&items, &assembler)?;
            stats.duration = start_time.elapsed();
            return Ok(stats);
        }

        let generator = self.generator.as_deref().ok_or(Error::MissingApiKey)?;

        let mut recorder = ProgressRecorder::for_output(&self.config.output_path);
        if self.config.fresh {
            info!("Discarding saved progress");
            recorder.clear()?;
        }
        let resume = recorder.load(&items)?;
        stats.resumed_items = recorder.marker();
        let mut results = resume.results;

        let mut controller = RetryController::new(
            generator,
            &assembler,
            ResponseValidator::new(self.config.cards_per_item),
            self.config.retry,
        );

        let mut queue: VecDeque<Batch> =
            Batcher::resume_after(&items, resume.marker, self.config.batch_size).collect();

        while let Some(batch) = queue.pop_front() {
            info!(
                "Generating cards for items {}-{} of {}",
                batch.first_position(),
                batch.last_position(),
                items.len()
            );

            match controller.process(&batch)? {
                BatchOutcome::Completed(validated) => {
                    for warning in &validated.warnings {
                        warn!("{}", warning);
                    }
                    stats.warnings += validated.warnings.len();

                    recorder.record(&validated.results)?;
                    stats.processed_items += validated.results.len();
                    stats.batches += 1;
                    results.extend(validated.results);
                }
                BatchOutcome::Split(first, second) => {
                    queue.push_front(second);
                    queue.push_front(first);
                }
            }
        }

        stats.requests = controller.requests();
        stats.retries = controller.retries();

        let formatter = DeckFormatter::new(&self.config.deck_name, self.config.reverse);
        stats.total_cards = formatter.write(
            &self.config.output_path,
            &results,
            self.config.backup_existing,
        )?;
        recorder.clear()?;

        stats.duration = start_time.elapsed();
        info!(
            "✓ Generated {} cards in {:.2}s",
            stats.total_cards,
            stats.duration.as_secs_f64()
        );

        Ok(stats)
    }

    /// Prints every message a real run would send and returns the batch count.
    fn print_dry_run(&self, items: &[Item], assembler: &PromptAssembler) -> Result<usize> {
        println!("Model: {}", self.config.model);
        println!("\n=== SYSTEM MESSAGE (cached) ===");
        println!("{}", preview(&assembler.system_message().text, SYSTEM_PREVIEW_CHARS));

        let mut batches = 0;
        for batch in Batcher::new(items, self.config.batch_size) {
            batches += 1;
            println!(
                "\n=== USER MESSAGE {} (items {}-{}) ===",
                batches,
                batch.first_position(),
                batch.last_position()
            );
            println!("{}", assembler.user_message(&batch)?);
        }

        Ok(batches)
    }
}

/// First `limit` chars of `text`, with a note on how much was cut.
fn preview(text: &str, limit: usize) -> String {
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }

    let head: String = text.chars().take(limit).collect();
    format!("{head}... ({} more chars)", total - limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::GenerationRequest;
    use crate::error::ApiError;
    use crate::retry::RetryPolicy;
    use assert_fs::prelude::*;
    use serde_json::{Value, json};
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;
    use std::rc::Rc;

    fn write_fixture(root: &Path, item_count: usize) {
        fs::write(root.join("PROMPT.md"), "Translate each word into Spanish.").unwrap();

        let mut input = String::from("# vocabulary\n\n");
        for i in 1..=item_count {
            input.push_str(&format!("word{i}\n"));
        }
        fs::write(root.join("input.txt"), input).unwrap();
    }

    fn config(root: &Path, batch_size: usize) -> crate::config::ConfigBuilder {
        Config::builder()
            .input_path(root.join("input.txt"))
            .prompt_path(root.join("PROMPT.md"))
            .output_path(root.join("deck.txt"))
            .deck_name("Spanish")
            .batch_size(batch_size)
            .backup_existing(false)
            .retry_policy(RetryPolicy::immediate())
    }

    fn cards_for(item: &Item, count: usize) -> Value {
        (1..=count)
            .map(|c| {
                json!({
                    "front": format!("{} q{c}", item.text),
                    "back": format!("{} a{c}", item.text),
                })
            })
            .collect()
    }

    /// Answers every request correctly with `count` cards per item.
    fn respond(batch: &Batch, count: usize) -> String {
        if let [item] = batch.items() {
            json!({ "cards": cards_for(item, count) }).to_string()
        } else {
            let entries: Vec<Value> = batch
                .items()
                .iter()
                .map(|item| json!({ "input": item.text, "cards": cards_for(item, count) }))
                .collect();
            json!({ "items": entries }).to_string()
        }
    }

    /// Generator that records the first position of every request it sees.
    fn recording(
        count: usize,
        fail_at: Option<usize>,
    ) -> (
        impl Fn(&GenerationRequest<'_>) -> std::result::Result<String, ApiError>,
        Rc<RefCell<Vec<usize>>>,
    ) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        let generator = move |request: &GenerationRequest<'_>| {
            log.borrow_mut().push(request.batch.first_position());
            if fail_at == Some(request.batch.first_position()) {
                return Err(ApiError::other("connection reset"));
            }
            Ok(respond(request.batch, count))
        };
        (generator, seen)
    }

    #[test]
    fn test_full_run_writes_deck_and_clears_progress() {
        let temp = assert_fs::TempDir::new().unwrap();
        write_fixture(temp.path(), 3);

        let (generator, seen) = recording(2, None);
        let config = config(temp.path(), 2).cards_per_item(2).build().unwrap();
        let stats = Pipeline::with_generator(config, generator)
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(stats.total_items, 3);
        assert_eq!(stats.processed_items, 3);
        assert_eq!(stats.total_cards, 6);
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.requests, 2);
        assert_eq!(*seen.borrow(), vec![1, 3]);

        temp.child("deck.txt").assert(
            "#separator:Tab\n#html:true\n#deck column:1\n\
             Spanish\tword1 q1\tword1 a1\nSpanish\tword1 q2\tword1 a2\n\
             Spanish\tword2 q1\tword2 a1\nSpanish\tword2 q2\tword2 a2\n\
             Spanish\tword3 q1\tword3 a1\nSpanish\tword3 q2\tword3 a2\n",
        );
        assert!(!temp.child("deck.partial").path().exists());
        assert!(!temp.child("deck.progress").path().exists());
    }

    #[test]
    fn test_resume_matches_uninterrupted_run() {
        let uninterrupted = assert_fs::TempDir::new().unwrap();
        write_fixture(uninterrupted.path(), 10);
        let (generator, _) = recording(1, None);
        Pipeline::with_generator(config(uninterrupted.path(), 2).build().unwrap(), generator)
            .unwrap()
            .run()
            .unwrap();
        let expected = fs::read_to_string(uninterrupted.path().join("deck.txt")).unwrap();

        let temp = assert_fs::TempDir::new().unwrap();
        write_fixture(temp.path(), 10);

        // batches 1 and 2 succeed, batch 3 fails
        let (generator, _) = recording(1, Some(5));
        let err = Pipeline::with_generator(config(temp.path(), 2).build().unwrap(), generator)
            .unwrap()
            .run()
            .unwrap_err();
        match err {
            Error::BatchFailed {
                first_item,
                resume_after,
                ..
            } => {
                assert_eq!(first_item, 5);
                assert_eq!(resume_after, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        temp.child("deck.progress").assert("4");
        assert!(!temp.child("deck.txt").path().exists());

        let (generator, seen) = recording(1, None);
        let stats = Pipeline::with_generator(config(temp.path(), 2).build().unwrap(), generator)
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(*seen.borrow(), vec![5, 7, 9]);
        assert_eq!(stats.resumed_items, 4);
        assert_eq!(stats.processed_items, 6);
        temp.child("deck.txt").assert(expected.as_str());
    }

    #[test]
    fn test_fresh_ignores_saved_progress() {
        let temp = assert_fs::TempDir::new().unwrap();
        write_fixture(temp.path(), 2);
        temp.child("deck.progress").write_str("garbage").unwrap();

        let (generator, seen) = recording(1, None);
        let stats = Pipeline::with_generator(
            config(temp.path(), 1).fresh(true).build().unwrap(),
            generator,
        )
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(stats.resumed_items, 0);
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_corrupt_progress_without_fresh_fails() {
        let temp = assert_fs::TempDir::new().unwrap();
        write_fixture(temp.path(), 2);
        temp.child("deck.progress").write_str("garbage").unwrap();

        let (generator, seen) = recording(1, None);
        let err = Pipeline::with_generator(config(temp.path(), 1).build().unwrap(), generator)
            .unwrap()
            .run()
            .unwrap_err();

        assert!(matches!(err, Error::Progress { .. }));
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn test_timeout_splits_batch_and_keeps_order() {
        let temp = assert_fs::TempDir::new().unwrap();
        write_fixture(temp.path(), 5);

        let sizes = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&sizes);
        let generator = move |request: &GenerationRequest<'_>| {
            log.borrow_mut().push(request.batch.len());
            if request.batch.len() > 2 {
                Err(ApiError::Timeout)
            } else {
                Ok(respond(request.batch, 1))
            }
        };

        let stats = Pipeline::with_generator(config(temp.path(), 5).build().unwrap(), generator)
            .unwrap()
            .run()
            .unwrap();

        // 5 -> 3 + 2, then 3 -> 2 + 1
        assert_eq!(*sizes.borrow(), vec![5, 3, 2, 1, 2]);
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.total_cards, 5);

        let deck = fs::read_to_string(temp.path().join("deck.txt")).unwrap();
        let fronts: Vec<&str> = deck
            .lines()
            .skip(3)
            .filter_map(|l| l.split('\t').nth(1))
            .collect();
        assert_eq!(
            fronts,
            vec!["word1 q1", "word2 q1", "word3 q1", "word4 q1", "word5 q1"]
        );
    }

    #[test]
    fn test_reverse_and_warnings() {
        let temp = assert_fs::TempDir::new().unwrap();
        write_fixture(temp.path(), 1);

        let generator = |_: &GenerationRequest<'_>| {
            Ok::<_, ApiError>(r#"{"cards":[{"front":"busy","back":"  "}]}"#.to_string())
        };
        let stats = Pipeline::with_generator(
            config(temp.path(), 1).reverse(true).build().unwrap(),
            generator,
        )
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(stats.warnings, 1);
        assert_eq!(stats.retries, 0);
        temp.child("deck.txt")
            .assert("#separator:Tab\n#html:true\n#deck column:1\nSpanish\t  \tbusy\n");
    }

    #[test]
    fn test_retries_are_counted() {
        let temp = assert_fs::TempDir::new().unwrap();
        write_fixture(temp.path(), 1);

        let calls = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&calls);
        let generator = move |request: &GenerationRequest<'_>| {
            *counter.borrow_mut() += 1;
            if *counter.borrow() == 1 {
                Err(ApiError::RateLimited { retry_after: None })
            } else {
                Ok(respond(request.batch, 1))
            }
        };

        let stats = Pipeline::with_generator(config(temp.path(), 1).build().unwrap(), generator)
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(stats.requests, 2);
        assert_eq!(stats.retries, 1);
    }

    #[test]
    fn test_dry_run_sends_and_writes_nothing() {
        let temp = assert_fs::TempDir::new().unwrap();
        write_fixture(temp.path(), 3);

        let (generator, seen) = recording(1, None);
        let stats = Pipeline::with_generator(
            config(temp.path(), 2).dry_run(true).build().unwrap(),
            generator,
        )
        .unwrap()
        .run()
        .unwrap();

        assert!(stats.dry_run);
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.requests, 0);
        assert!(seen.borrow().is_empty());
        assert!(!temp.child("deck.txt").path().exists());
        assert!(!temp.child("deck.progress").path().exists());
    }

    #[test]
    fn test_dry_run_needs_no_api_key() {
        let temp = assert_fs::TempDir::new().unwrap();
        write_fixture(temp.path(), 1);

        let config = config(temp.path(), 1).dry_run(true).build().unwrap();
        assert!(Pipeline::new(config).is_ok());
    }

    #[test]
    fn test_missing_api_key() {
        let temp = assert_fs::TempDir::new().unwrap();
        write_fixture(temp.path(), 1);

        let config = config(temp.path(), 1).build().unwrap();
        assert!(matches!(Pipeline::new(config), Err(Error::MissingApiKey)));
    }

    #[test]
    fn test_output_sharing_a_progress_path_is_rejected() {
        for output in ["deck.progress", "deck.partial"] {
            let temp = assert_fs::TempDir::new().unwrap();
            write_fixture(temp.path(), 2);

            let (generator, seen) = recording(1, None);
            let config = Config {
                output_path: temp.path().join(output),
                ..config(temp.path(), 1).build().unwrap()
            };
            let result = Pipeline::with_generator(config, generator);

            assert!(matches!(result, Err(Error::Config { .. })), "accepted {output}");
            assert!(seen.borrow().is_empty());
            assert!(!temp.child(output).path().exists());
        }
    }

    #[test]
    fn test_empty_input() {
        let temp = assert_fs::TempDir::new().unwrap();
        write_fixture(temp.path(), 0);

        let (generator, _) = recording(1, None);
        let err = Pipeline::with_generator(config(temp.path(), 1).build().unwrap(), generator)
            .unwrap()
            .run()
            .unwrap_err();
        assert!(matches!(err, Error::EmptyInput { .. }));
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdef", 4), "abcd... (2 more chars)");
    }
}
