use crate::{
    batcher::Batch,
    config::Config,
    error::{Error, Result},
};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tera::{Context, Tera};

const INSTRUCTION_TEMPLATE: &str = "instruction";
const USER_SINGLE_TEMPLATE: &str = "user_single";
const USER_BATCH_TEMPLATE: &str = "user_batch";

/// Separator between the fixed instructions and the user's content rules.
const RULES_SEPARATOR: &str = "\n\n---\n\n";

/// The per-run system message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemMessage {
    /// Instructions followed by the content rules
    pub text: String,

    /// Ask the API to cache this block across requests
    pub cacheable: bool,
}

#[derive(Serialize)]
struct SingleContext<'a> {
    cards_count: usize,
    item: &'a str,
}

#[derive(Serialize)]
struct BatchContext<'a> {
    cards_count: usize,
    items: Vec<&'a str>,
}

/// Builds the system message once per run and a user message per batch.
///
/// Item text is passed through untouched; the model interprets it according
/// to the content rules.
pub struct PromptAssembler {
    tera: Tera,
    system: SystemMessage,
    cards_per_item: usize,
}

impl PromptAssembler {
    /// Creates an assembler from content rules text.
    ///
    /// # Errors
    ///
    /// Returns an error if template registration or rendering fails.
    pub fn new(rules: &str, cards_per_item: usize) -> Result<Self> {
        let mut tera = Tera::default();
        Self::register_builtin_templates(&mut tera)?;

        let mut context = Context::new();
        context.insert("cards_count", &cards_per_item);
        let instruction = tera
            .render(INSTRUCTION_TEMPLATE, &context)
            .map_err(|e| Error::template(INSTRUCTION_TEMPLATE, e))?;

        let system = SystemMessage {
            text: format!("{}{RULES_SEPARATOR}{}", instruction.trim_end(), rules.trim()),
            cacheable: true,
        };

        Ok(Self {
            tera,
            system,
            cards_per_item,
        })
    }

    /// Creates an assembler from the content rules file named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rules file cannot be read.
    pub fn from_config(config: &Config) -> Result<Self> {
        let rules = read_rules(&config.prompt_path)?;
        Self::new(&rules, config.cards_per_item)
    }

    fn register_builtin_templates(tera: &mut Tera) -> Result<()> {
        tera.add_raw_template(
            INSTRUCTION_TEMPLATE,
            include_str!("../templates/instruction.tera"),
        )
        .map_err(|e| Error::template(INSTRUCTION_TEMPLATE, e))?;

        tera.add_raw_template(
            USER_SINGLE_TEMPLATE,
            include_str!("../templates/user_single.tera"),
        )
        .map_err(|e| Error::template(USER_SINGLE_TEMPLATE, e))?;

        tera.add_raw_template(
            USER_BATCH_TEMPLATE,
            include_str!("../templates/user_batch.tera"),
        )
        .map_err(|e| Error::template(USER_BATCH_TEMPLATE, e))?;

        Ok(())
    }

    /// The cached system message shared by every request of the run.
    #[must_use]
    pub const fn system_message(&self) -> &SystemMessage {
        &self.system
    }

    /// Renders the request message for `batch`.
    ///
    /// # Errors
    ///
    /// Returns an error if template rendering fails.
    pub fn user_message(&self, batch: &Batch) -> Result<String> {
        let (template, context) = if let [item] = batch.items() {
            let ctx = SingleContext {
                cards_count: self.cards_per_item,
                item: &item.text,
            };
            (USER_SINGLE_TEMPLATE, Context::from_serialize(ctx))
        } else {
            let ctx = BatchContext {
                cards_count: self.cards_per_item,
                items: batch.items().iter().map(|i| i.text.as_str()).collect(),
            };
            (USER_BATCH_TEMPLATE, Context::from_serialize(ctx))
        };

        let context = context.map_err(|e| Error::template(template, e))?;
        let rendered = self
            .tera
            .render(template, &context)
            .map_err(|e| Error::template(template, e))?;

        Ok(rendered.trim_end().to_string())
    }
}

fn read_rules(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::io(path, e))
}
