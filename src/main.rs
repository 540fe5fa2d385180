use anyhow::Context;
use anki_gen::{Config, Pipeline};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    name = "anki-gen",
    version,
    author,
    about = "Generate Anki flashcard decks from a list of items",
    long_about = "Generate Anki flashcard decks from a plain-text list of items.\n\n\
    Every non-blank line of the input file is one item; lines starting with '#' \
    are skipped. The content rules in the prompt file tell the model what cards \
    to write. Progress is saved after every batch, so an interrupted run picks up \
    where it stopped when the same command is run again.\n\n\
    USAGE EXAMPLES:\n  \
      # One card per word, default prompt and output\n  \
      anki-gen words.txt\n\n  \
      # Two cards per item, ten items per request, custom deck\n  \
      anki-gen words.txt -c 2 -b 10 -d \"Spanish::Verbs\"\n\n  \
      # Show the requests without calling the API\n  \
      anki-gen words.txt --dry-run"
)]
struct Cli {
    /// Text file with one item per line
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// File with the content rules for card generation
    #[arg(short, long, default_value = "./PROMPT.md", value_name = "FILE")]
    prompt: PathBuf,

    /// Deck file to write
    #[arg(short, long, default_value = "./OUTPUT.txt", value_name = "FILE")]
    output: PathBuf,

    /// Anki deck name
    #[arg(short, long, default_value = "Default")]
    deck: String,

    /// Swap question and answer columns
    #[arg(short, long)]
    reverse: bool,

    /// Cards to generate per item
    #[arg(short, long, default_value_t = 1, value_name = "N")]
    cards: usize,

    /// Items per API request
    #[arg(short, long, default_value_t = 1, value_name = "N")]
    batch_size: usize,

    /// Model identifier
    #[arg(short, long, default_value = "claude-sonnet-4-20250514")]
    model: String,

    /// Response token limit per request
    #[arg(long, default_value_t = 4096)]
    max_tokens: u32,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 120, value_name = "SECS")]
    timeout: u64,

    /// Print the requests instead of sending them
    #[arg(long)]
    dry_run: bool,

    /// Discard saved progress and start over
    #[arg(long)]
    fresh: bool,

    /// Append every request and response to this file
    #[arg(long, value_name = "FILE")]
    api_log: Option<PathBuf>,

    /// API key (defaults to the ANTHROPIC_API_KEY environment variable)
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    // .env has to be loaded before clap reads ANTHROPIC_API_KEY
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    setup_tracing(cli.verbose)?;

    let mut builder = Config::builder()
        .input_path(cli.input)
        .prompt_path(cli.prompt)
        .output_path(cli.output)
        .deck_name(cli.deck)
        .reverse(cli.reverse)
        .cards_per_item(cli.cards)
        .batch_size(cli.batch_size)
        .model(cli.model)
        .max_tokens(cli.max_tokens)
        .request_timeout(Duration::from_secs(cli.timeout))
        .dry_run(cli.dry_run)
        .fresh(cli.fresh);

    if let Some(api_key) = cli.api_key {
        builder = builder.api_key(api_key);
    }

    if let Some(api_log) = cli.api_log {
        builder = builder.api_log(api_log);
    }

    let config = builder.build().context("Failed to build configuration")?;

    let stats = Pipeline::new(config)
        .context("Failed to create pipeline")?
        .run()
        .context("Deck generation failed")?;

    stats.print_summary();
    Ok(())
}

fn setup_tracing(verbosity: u8) -> anyhow::Result<()> {
    let filter = match verbosity {
        0 => EnvFilter::new("anki_gen=info"),
        1 => EnvFilter::new("anki_gen=debug"),
        _ => EnvFilter::new("anki_gen=trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}
