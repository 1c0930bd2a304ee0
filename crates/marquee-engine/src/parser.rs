//! Intent extraction: a language-model pass per field with local recovery.
//!
//! `parse_initial` runs the three sub-parses concurrently and degrades each
//! one on its own: a failed selection or season spec becomes `None`, and the
//! query falls through an ordered ladder that ends in an infallible
//! stop-word stage.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use marquee_core::errors::{ParseError, ServiceError};
use marquee_core::provider::{LanguageModel, PromptMessage};
use marquee_core::selection::{RawStructuredSelection, SelectionCriterion};
use marquee_llm::{Resilience, RetryPolicy};

/// Resilience service name for every model call.
pub const MODEL_SERVICE: &str = "language-model";

pub const QUERY_TASK: &str = "TASK: extract-title";
pub const SELECTION_TASK: &str = "TASK: classify-selection";
pub const STRUCTURED_TASK: &str = "TASK: season-episode-selection";

const QUERY_INSTRUCTIONS: &str = "Return only the movie or series title the user is asking about. \
No quotes, no explanation. If no title is present, return an empty reply.";

const SELECTION_INSTRUCTIONS: &str = "The user is choosing one item from a numbered list. Reply with JSON \
{\"selectionType\": \"ordinal\" | \"year\", \"value\": <string>}. Use \"ordinal\" for a position \
(\"the second one\" -> \"2\") and \"year\" for a release year. Reply null if the user names neither.";

const STRUCTURED_INSTRUCTIONS: &str = "Extract which seasons and episodes of a series the user wants. \
Reply with JSON: {} for the whole series, or {\"entries\": [{\"season\": <int>, \"episodes\": [<int>]}]} \
with episodes omitted for full seasons. Reply null if the user says nothing about seasons.";

/// Action verbs and domain nouns only. Pronouns and particles such as "up"
/// or "i" appear in real titles and are kept.
const STOP_WORDS: &[&str] = &[
    "download", "add", "get", "grab", "find", "search", "for", "please", "watch", "remove", "delete",
    "unmonitor", "show", "shows", "series", "tv", "movie", "movies", "film", "the",
];

/// Result of the initial parse of a new request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedIntent {
    pub query: String,
    pub selection: Option<SelectionCriterion>,
    pub structured_selection: Option<RawStructuredSelection>,
}

/// Language model behind the resilience layer.
#[derive(Clone)]
pub struct ModelGateway {
    model: Arc<dyn LanguageModel>,
    resilience: Arc<Resilience>,
    policy: RetryPolicy,
}

impl ModelGateway {
    pub fn new(model: Arc<dyn LanguageModel>, resilience: Arc<Resilience>, policy: RetryPolicy) -> Self {
        Self {
            model,
            resilience,
            policy,
        }
    }

    pub async fn ask(&self, task: &str, instructions: &str, text: &str) -> Result<String, ServiceError> {
        let prompt = vec![
            PromptMessage::system(format!("{task}\n{instructions}")),
            PromptMessage::user(text),
        ];
        self.invoke(&prompt).await
    }

    pub async fn invoke(&self, prompt: &[PromptMessage]) -> Result<String, ServiceError> {
        self.resilience
            .execute(MODEL_SERVICE, &self.policy, || self.model.invoke(prompt))
            .await
    }
}

/// One rung of the query-extraction ladder.
#[async_trait]
pub trait QueryStage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn extract(&self, text: &str) -> Result<String, ParseError>;
}

/// Asks the model for the title. A blank reply yields the trimmed input.
pub struct ModelQueryStage {
    gateway: ModelGateway,
}

impl ModelQueryStage {
    pub fn new(gateway: ModelGateway) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl QueryStage for ModelQueryStage {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn extract(&self, text: &str) -> Result<String, ParseError> {
        let reply = self.gateway.ask(QUERY_TASK, QUERY_INSTRUCTIONS, text).await?;
        let cleaned = reply.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`').trim();
        if cleaned.is_empty() {
            return Ok(text.trim().to_string());
        }
        Ok(cleaned.to_string())
    }
}

/// Drops action verbs and domain nouns. Never fails.
pub struct StopWordStage;

#[async_trait]
impl QueryStage for StopWordStage {
    fn name(&self) -> &'static str {
        "stop-words"
    }

    async fn extract(&self, text: &str) -> Result<String, ParseError> {
        Ok(strip_stop_words(text))
    }
}

pub fn strip_stop_words(text: &str) -> String {
    text.split_whitespace()
        .filter(|token| {
            let word = token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            !STOP_WORDS.contains(&word.as_str())
        })
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

pub struct IntentParser {
    gateway: ModelGateway,
    query_stages: Vec<Box<dyn QueryStage>>,
}

impl IntentParser {
    /// Default ladder: model, then stop-word stripping.
    pub fn new(gateway: ModelGateway) -> Self {
        let query_stages: Vec<Box<dyn QueryStage>> =
            vec![Box::new(ModelQueryStage::new(gateway.clone())), Box::new(StopWordStage)];
        Self {
            gateway,
            query_stages,
        }
    }

    pub fn with_query_stages(mut self, stages: Vec<Box<dyn QueryStage>>) -> Self {
        self.query_stages = stages;
        self
    }

    pub fn gateway(&self) -> &ModelGateway {
        &self.gateway
    }

    pub async fn extract_query(&self, text: &str) -> String {
        for stage in &self.query_stages {
            match stage.extract(text).await {
                Ok(query) => {
                    debug!(stage = stage.name(), query = %query, "query extracted");
                    return query;
                }
                Err(e) => {
                    warn!(stage = stage.name(), error = %e, "query stage failed, falling back");
                }
            }
        }
        strip_stop_words(text)
    }

    pub async fn parse_selection(&self, text: &str) -> Result<SelectionCriterion, ParseError> {
        let reply = self.gateway.ask(SELECTION_TASK, SELECTION_INSTRUCTIONS, text).await?;
        let Some(value) = reply_json(&reply)? else {
            return Err(ParseError::NotSpecified);
        };
        selection_from_json(&value)
    }

    pub async fn parse_structured_selection(&self, text: &str) -> Result<RawStructuredSelection, ParseError> {
        let reply = self.gateway.ask(STRUCTURED_TASK, STRUCTURED_INSTRUCTIONS, text).await?;
        let Some(value) = reply_json(&reply)? else {
            return Err(ParseError::NotSpecified);
        };
        serde_json::from_value(value).map_err(|e| ParseError::Schema(e.to_string()))
    }

    /// Query plus both selections, each isolated from the others' failures.
    pub async fn parse_initial(&self, text: &str) -> ParsedIntent {
        let (query, selection, structured) = tokio::join!(
            self.extract_query(text),
            self.parse_selection(text),
            self.parse_structured_selection(text),
        );
        ParsedIntent {
            query,
            selection: settle("selection", selection),
            structured_selection: settle("structured_selection", structured),
        }
    }
}

fn settle<T>(field: &'static str, result: Result<T, ParseError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(ParseError::NotSpecified) => None,
        Err(e) => {
            warn!(field, error = %e, "sub-parse failed, treating as absent");
            None
        }
    }
}

fn selection_from_json(value: &Value) -> Result<SelectionCriterion, ParseError> {
    let Some(object) = value.as_object() else {
        return Err(ParseError::Schema(format!("expected object, got {value}")));
    };
    let raw_value = match object.get("value") {
        None | Some(Value::Null) => return Err(ParseError::NotSpecified),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => return Err(ParseError::Schema(format!("unsupported selection value {other}"))),
    };
    match object.get("selectionType") {
        None | Some(Value::Null) => Err(ParseError::NotSpecified),
        Some(Value::String(kind)) => match kind.trim().to_ascii_lowercase().as_str() {
            "ordinal" => Ok(SelectionCriterion::Ordinal(raw_value)),
            "year" => Ok(SelectionCriterion::Year(raw_value)),
            _ => Err(ParseError::UnknownSelectionType(kind.clone())),
        },
        Some(other) => Err(ParseError::UnknownSelectionType(other.to_string())),
    }
}

/// JSON payload of a model reply. `Ok(None)` when the model said `null`
/// or nothing at all.
fn reply_json(reply: &str) -> Result<Option<Value>, ParseError> {
    let trimmed = strip_code_fence(reply.trim());
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        return Ok(None);
    }
    let Some(object) = first_json_object(trimmed) else {
        return Err(ParseError::Schema(format!("no JSON object in reply: {trimmed}")));
    };
    match serde_json::from_str::<Value>(object) {
        Ok(Value::Null) => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(ParseError::Schema(e.to_string())),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(inner) = text.strip_prefix("```") else {
        return text;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// First balanced `{...}` span, honouring string literals and escapes.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
