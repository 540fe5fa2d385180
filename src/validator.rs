//! Checks model responses against the card contract.
//!
//! A batch of one item expects `{"cards": [...]}`; larger batches expect
//! `{"items": [{"input": ..., "cards": [...]}, ...]}` with one entry per item,
//! matched by position. Both shapes funnel into the same per-item checks.

use crate::{batcher::Batch, error::ValidationError, reader::Item};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// One flashcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    /// Question side
    pub front: String,

    /// Answer side
    pub back: String,
}

impl Card {
    /// Creates a new card.
    #[must_use]
    pub fn new(front: impl Into<String>, back: impl Into<String>) -> Self {
        Self {
            front: front.into(),
            back: back.into(),
        }
    }
}

/// The validated cards for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// The item the cards were generated for
    pub item: Item,

    /// Cards in generation order
    pub cards: Vec<Card>,
}

/// Which side of a card was blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardField {
    /// The `front` field
    Front,
    /// The `back` field
    Back,
}

impl fmt::Display for CardField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Front => f.write_str("front"),
            Self::Back => f.write_str("back"),
        }
    }
}

/// Non-fatal content issue; the card is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// A present but blank `front` or `back`.
    EmptyField {
        /// Position of the item
        item: usize,
        /// 1-based index of the card within the item
        card: usize,
        /// The blank field
        field: CardField,
    },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyField { item, card, field } => {
                write!(f, "Item {item}, card {card} has empty {field}")
            }
        }
    }
}

/// Output of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validated {
    /// One result per batch item, in batch order
    pub results: Vec<GenerationResult>,

    /// Content warnings
    pub warnings: Vec<ValidationWarning>,
}

/// Expected response shape, resolved from the batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseShape {
    Single,
    Batch,
}

impl ResponseShape {
    fn for_batch(batch: &Batch) -> Self {
        if batch.len() == 1 { Self::Single } else { Self::Batch }
    }
}

#[derive(Deserialize)]
struct SingleResponse {
    cards: Vec<Card>,
}

#[derive(Deserialize)]
struct BatchResponse {
    items: Vec<BatchEntry>,
}

#[derive(Deserialize)]
struct BatchEntry {
    #[serde(default)]
    input: Option<String>,
    cards: Vec<Card>,
}

/// Validates responses for a fixed number of cards per item.
#[derive(Debug, Clone, Copy)]
pub struct ResponseValidator {
    cards_per_item: usize,
}

impl ResponseValidator {
    /// Creates a validator expecting `cards_per_item` cards for every item.
    #[must_use]
    pub const fn new(cards_per_item: usize) -> Self {
        Self { cards_per_item }
    }

    /// Validates `raw` as the response for `batch`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MalformedResponse`] for unparseable or
    /// mis-shaped JSON, [`ValidationError::ItemCountMismatch`] when batch
    /// entries are missing or extra, and [`ValidationError::CardCountMismatch`]
    /// when an item has the wrong number of cards.
    pub fn validate(&self, raw: &str, batch: &Batch) -> Result<Validated, ValidationError> {
        let value = parse_json(raw)?;

        let card_lists: Vec<Vec<Card>> = match ResponseShape::for_batch(batch) {
            ResponseShape::Single => {
                let response: SingleResponse = serde_json::from_value(value)
                    .map_err(|e| ValidationError::malformed(format!("single-item shape: {e}")))?;
                vec![response.cards]
            }
            ResponseShape::Batch => {
                let response: BatchResponse = serde_json::from_value(value)
                    .map_err(|e| ValidationError::malformed(format!("batch shape: {e}")))?;

                if response.items.len() != batch.len() {
                    return Err(ValidationError::ItemCountMismatch {
                        expected: batch.len(),
                        actual: response.items.len(),
                    });
                }

                response
                    .items
                    .into_iter()
                    .zip(batch.items())
                    .map(|(entry, item)| {
                        if let Some(echo) = entry.input.as_deref() {
                            if echo.trim() != item.text {
                                debug!(
                                    item = item.position,
                                    echoed = echo,
                                    "Echoed input differs from item text"
                                );
                            }
                        }
                        entry.cards
                    })
                    .collect()
            }
        };

        let mut results = Vec::with_capacity(batch.len());
        let mut warnings = Vec::new();

        for (cards, item) in card_lists.into_iter().zip(batch.items()) {
            if cards.len() != self.cards_per_item {
                return Err(ValidationError::CardCountMismatch {
                    item: item.position,
                    expected: self.cards_per_item,
                    actual: cards.len(),
                });
            }

            for (index, card) in cards.iter().enumerate() {
                for (field, text) in [(CardField::Front, &card.front), (CardField::Back, &card.back)] {
                    if text.trim().is_empty() {
                        warnings.push(ValidationWarning::EmptyField {
                            item: item.position,
                            card: index + 1,
                            field,
                        });
                    }
                }
            }

            results.push(GenerationResult {
                item: item.clone(),
                cards,
            });
        }

        Ok(Validated { results, warnings })
    }
}

/// Parses model output, tolerating code fences and raw control characters.
fn parse_json(raw: &str) -> Result<serde_json::Value, ValidationError> {
    let text = extract_json(raw);

    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(first) => {
            let escaped = escape_control_chars(text);
            if escaped == text {
                return Err(ValidationError::malformed(format!("invalid JSON: {first}")));
            }
            serde_json::from_str(&escaped)
                .map_err(|e| ValidationError::malformed(format!("invalid JSON: {e}")))
        }
    }
}

/// Pulls the JSON object out of model output.
///
/// Takes the body of the first fenced block when there is one, otherwise
/// the span from the first `{` to the last `}`, so prose around the JSON is
/// ignored.
fn extract_json(raw: &str) -> &str {
    let text = raw.trim();

    if let (Some(start), Some(end)) = (text.find("```"), text.rfind("```")) {
        // skip the info string (e.g. "json") on the opening fence line
        let body_start = text[start..end].find('\n').map(|newline| start + newline + 1);
        if let Some(body_start) = body_start.filter(|&b| start < end && b < end) {
            return text[body_start..end].trim();
        }
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

/// Escapes control characters that appear inside JSON string literals.
fn escape_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if c.is_control() && (c as u32) < 0x20 => {
                    out.push_str(&format!("\\u{:04x}", c as u32));
                }
                c => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }

    out
}
