use crate::{error::Result, validator::GenerationResult, writer::DurableWriter};
use std::path::Path;
use tracing::info;

/// Anki import directives written before the card lines.
pub const DECK_HEADER: &str = "#separator:Tab\n#html:true\n#deck column:1";

/// Renders results as an Anki tab-separated import file.
///
/// Every card becomes `deck<TAB>front<TAB>back`, or `deck<TAB>back<TAB>front`
/// when reversed. Field text is escaped so a card always stays on one line
/// with exactly three columns.
#[derive(Debug, Clone)]
pub struct DeckFormatter {
    deck: String,
    reverse: bool,
}

impl DeckFormatter {
    /// Creates a formatter for `deck`.
    #[must_use]
    pub fn new(deck: impl Into<String>, reverse: bool) -> Self {
        Self {
            deck: deck.into(),
            reverse,
        }
    }

    /// Formats one card line, without the trailing newline.
    #[must_use]
    pub fn format_card(&self, front: &str, back: &str) -> String {
        let (question, answer) = if self.reverse {
            (back, front)
        } else {
            (front, back)
        };

        format!(
            "{}\t{}\t{}",
            escape_field(&self.deck),
            escape_field(question),
            escape_field(answer)
        )
    }

    /// Renders the whole deck file, cards in item order.
    #[must_use]
    pub fn render(&self, results: &[GenerationResult]) -> String {
        let mut out = String::from(DECK_HEADER);
        out.push('\n');

        for result in results {
            for card in &result.cards {
                out.push_str(&self.format_card(&card.front, &card.back));
                out.push('\n');
            }
        }

        out
    }

    /// Renders `results` and atomically replaces `path` with them.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be written.
    pub fn write(&self, path: &Path, results: &[GenerationResult], backup: bool) -> Result<usize> {
        let content = self.render(results);
        DurableWriter::new(backup).replace(path, &content)?;

        let cards = results.iter().map(|r| r.cards.len()).sum();
        info!("Wrote {} cards to {}", cards, path.display());
        Ok(cards)
    }
}

/// Makes `text` safe for one tab-separated column.
///
/// Tabs become spaces and line breaks become `<br>`, which the `#html:true`
/// header renders as a break.
#[must_use]
pub fn escape_field(text: &str) -> String {
    text.replace("\r\n", "<br>")
        .replace(['\n', '\r'], "<br>")
        .replace('\t', " ")
}
