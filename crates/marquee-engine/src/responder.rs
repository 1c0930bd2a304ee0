use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use marquee_core::errors::ServiceError;
use marquee_core::messages::{ChatMessage, ChatRole, OutboundMessage, ResolutionState, TemplateKey};
use marquee_core::provider::{PromptMessage, ResponseGenerator};

use crate::parser::ModelGateway;

pub const RESPONSE_TASK: &str = "TASK: compose-reply";

const RESPONSE_INSTRUCTIONS: &str = "You are a friendly media assistant. Rewrite the draft reply below \
in a natural tone. Keep every title, year and list number exactly as given and never mention a title \
that is not in the data. Reply with the message text only.";

const HISTORY_WINDOW: usize = 6;

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

/// `"Title" (1999)`, or `that title` when the data names nothing.
fn titled(item: &Value) -> String {
    match (str_field(item, "title"), item.get("year").and_then(Value::as_i64)) {
        (Some(title), Some(year)) => format!("\"{title}\" ({year})"),
        (Some(title), None) => format!("\"{title}\""),
        _ => "that title".to_string(),
    }
}

/// Deterministic text for every reply the resolver produces.
#[derive(Clone, Debug, Default)]
pub struct TemplateResponder;

impl TemplateResponder {
    pub fn render(&self, template: TemplateKey, data: &Value) -> String {
        match template {
            TemplateKey::Clarify => {
                "What would you like me to look for? Tell me a movie or series title.".to_string()
            }
            TemplateKey::NoResults => match str_field(data, "query") {
                Some(query) => format!("I couldn't find anything matching {query}."),
                None => "I couldn't find anything matching that.".to_string(),
            },
            TemplateKey::Disambiguate => {
                let candidates = data.get("candidates").and_then(Value::as_array);
                let mut text = match str_field(data, "query") {
                    Some(query) => format!("I found several matches for {query}. Which one did you mean?"),
                    None => "Which one did you mean?".to_string(),
                };
                for (i, item) in candidates.into_iter().flatten().enumerate() {
                    text.push_str(&format!("\n{}. {}", i + 1, titled(item)));
                }
                text
            }
            TemplateKey::AskSeasons => match str_field(data, "action") {
                Some("remove") => format!(
                    "Which seasons of {} should I remove? Say all seasons, or something like season 1.",
                    titled(data)
                ),
                _ => format!(
                    "Which seasons of {} do you want? Say all seasons, or something like season 1 or season 2 episodes 1 to 3.",
                    titled(data)
                ),
            },
            TemplateKey::Added => {
                let mut text = format!("Added {} to your library", titled(data));
                if let Some(selection) = str_field(data, "selection") {
                    text.push_str(&format!(" ({selection})"));
                }
                text.push('.');
                if data.get("searchTriggered").and_then(Value::as_bool) == Some(true) {
                    text.push_str(" A search for downloads has started.");
                }
                text
            }
            TemplateKey::AlreadyPresent => format!("{} is already in your library.", titled(data)),
            TemplateKey::Removed => {
                let mut text = format!("Removed {} from your library", titled(data));
                if let Some(selection) = str_field(data, "selection") {
                    text.push_str(&format!(" ({selection})"));
                }
                text.push('.');
                text
            }
            TemplateKey::Failed => {
                let action = str_field(data, "action").unwrap_or("process");
                let error = str_field(data, "error").unwrap_or("unknown error");
                let subject = match (str_field(data, "title"), str_field(data, "query")) {
                    (None, Some(query)) => query.to_string(),
                    _ => titled(data),
                };
                format!("Couldn't {action} {subject}: {error}")
            }
            TemplateKey::Cancelled => "Okay, I've cancelled that request.".to_string(),
        }
    }
}

#[async_trait]
impl ResponseGenerator for TemplateResponder {
    async fn generate(
        &self,
        _history: &[ChatMessage],
        _state: ResolutionState,
        template: TemplateKey,
        data: &Value,
    ) -> Result<OutboundMessage, ServiceError> {
        Ok(OutboundMessage::from_template(template, self.render(template, data)))
    }
}

/// Lets the language model phrase the template draft. Any model failure
/// yields the draft unchanged.
pub struct ModelResponder {
    gateway: ModelGateway,
    fallback: TemplateResponder,
}

impl ModelResponder {
    pub fn new(gateway: ModelGateway) -> Self {
        Self {
            gateway,
            fallback: TemplateResponder,
        }
    }

    fn prompt(
        &self,
        history: &[ChatMessage],
        state: ResolutionState,
        template: TemplateKey,
        data: &Value,
        draft: &str,
    ) -> Vec<PromptMessage> {
        let mut prompt = vec![PromptMessage::system(format!("{RESPONSE_TASK}\n{RESPONSE_INSTRUCTIONS}"))];
        let start = history.len().saturating_sub(HISTORY_WINDOW);
        prompt.extend(history[start..].iter().map(|m| match m.role {
            ChatRole::User => PromptMessage::user(m.content.clone()),
            ChatRole::Assistant => PromptMessage::assistant(m.content.clone()),
        }));
        let payload = json!({
            "state": state.as_str(),
            "template": template,
            "data": data,
            "draft": draft,
        });
        prompt.push(PromptMessage::user(payload.to_string()));
        prompt
    }
}

#[async_trait]
impl ResponseGenerator for ModelResponder {
    async fn generate(
        &self,
        history: &[ChatMessage],
        state: ResolutionState,
        template: TemplateKey,
        data: &Value,
    ) -> Result<OutboundMessage, ServiceError> {
        let draft = self.fallback.render(template, data);
        let prompt = self.prompt(history, state, template, data, &draft);
        match self.gateway.invoke(&prompt).await {
            Ok(reply) if !reply.trim().is_empty() => Ok(OutboundMessage::from_template(template, reply.trim())),
            Ok(_) => Ok(OutboundMessage::from_template(template, draft)),
            Err(e) => {
                warn!(template = ?template, error = %e, "reply generation failed, using template");
                Ok(OutboundMessage::from_template(template, draft))
            }
        }
    }
}
