// Document naming from content.
//
// Asks a completion model for a 2-4 word title. Any failure yields
// "Untitled" so callers can treat naming as best-effort.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use scrivener_common::types::UNTITLED;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::config::ConfigStore;
use crate::generation::provider::build_headers;

/// Content beyond this many characters is not sent for naming.
pub const NAMING_CONTENT_LIMIT: usize = 2_000;
/// Longest accepted name, cut back to a word boundary.
pub const MAX_NAME_CHARS: usize = 50;

const NAMING_TEMPERATURE: f64 = 0.3;
const NAMING_MAX_TOKENS: u32 = 10;
const NAMING_TIMEOUT: Duration = Duration::from_secs(30);

/// Produces a short title for a document body.
pub trait DocumentNamer: Send + Sync {
    fn name_from_content<'a>(&'a self, content: &'a str) -> Pin<Box<dyn Future<Output = String> + Send + 'a>>;
}

/// Build the naming prompt for (already truncated) content.
pub fn build_naming_prompt(content: &str) -> String {
    format!(
        "Based on this text content, generate a short, descriptive document name that is 2-4 words long. \
The name should capture the main theme, setting, or key elements of the text.

Text content:
{content}

Respond with ONLY the document name, nothing else. Example formats:
- \"Lighthouse Mystery\"
- \"Ocean Storm Night\"
- \"Ancient Forest Discovery\"
- \"Desert Caravan Journey\"

Document name:"
    )
}

/// Normalize a raw model answer into a document name.
pub fn clean_name(raw: &str) -> String {
    let unquoted = raw.trim().trim_matches('"').trim_matches('\'').trim();
    let first_line = unquoted.lines().next().unwrap_or_default().trim();

    let name = if first_line.chars().count() > MAX_NAME_CHARS {
        let capped: String = first_line.chars().take(MAX_NAME_CHARS).collect();
        match capped.rsplit_once(' ') {
            Some((head, _)) => head.to_string(),
            None => capped,
        }
    } else {
        first_line.to_string()
    };

    if name.is_empty() {
        UNTITLED.to_string()
    } else {
        name
    }
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}

/// Names documents with a non-streaming completion request.
pub struct CompletionNamer {
    client: reqwest::Client,
    config: Arc<ConfigStore>,
}

impl CompletionNamer {
    pub fn new(client: reqwest::Client, config: Arc<ConfigStore>) -> Self {
        Self { client, config }
    }

    async fn request_name(&self, content: &str) -> Result<String, String> {
        let settings = self.config.generation();
        let token = Some(settings.token.as_str()).filter(|token| !token.is_empty());
        let headers = build_headers(token).map_err(|e| e.to_string())?;
        let payload = json!({
            "model": settings.naming_model,
            "prompt": build_naming_prompt(truncate_chars(content, NAMING_CONTENT_LIMIT)),
            "temperature": NAMING_TEMPERATURE,
            "max_tokens": NAMING_MAX_TOKENS,
            "stream": false,
        });

        let response = self
            .client
            .post(&settings.naming_endpoint)
            .headers(headers)
            .json(&payload)
            .timeout(NAMING_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("naming request failed with status {}", status.as_u16()));
        }

        let body: Value = response.json().await.map_err(|e| e.to_string())?;
        let text = body.pointer("/choices/0/text").and_then(Value::as_str).unwrap_or_default();
        Ok(clean_name(text))
    }
}

impl DocumentNamer for CompletionNamer {
    fn name_from_content<'a>(&'a self, content: &'a str) -> Pin<Box<dyn Future<Output = String> + Send + 'a>> {
        Box::pin(async move {
            match self.request_name(content).await {
                Ok(name) => {
                    info!(name = %name, "generated document name");
                    name
                }
                Err(e) => {
                    error!(error = %e, "failed to generate document name");
                    UNTITLED.to_string()
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_name_strips_quotes_and_extra_lines() {
        assert_eq!(clean_name("  \"Lighthouse Mystery\"\n"), "Lighthouse Mystery");
        assert_eq!(clean_name("'Ocean Storm Night'"), "Ocean Storm Night");
        assert_eq!(clean_name("Desert Caravan\nJourney notes"), "Desert Caravan");
    }

    #[test]
    fn clean_name_caps_length_at_word_boundary() {
        let raw = "The Remarkably Long And Winding Tale Of The Northern Lighthouse Keeper";
        let name = clean_name(raw);
        assert!(name.chars().count() <= MAX_NAME_CHARS);
        assert_eq!(name, "The Remarkably Long And Winding Tale Of The");
    }

    #[test]
    fn clean_name_without_spaces_is_hard_cut() {
        let raw = "x".repeat(80);
        assert_eq!(clean_name(&raw), "x".repeat(MAX_NAME_CHARS));
    }

    #[test]
    fn empty_answer_is_untitled() {
        assert_eq!(clean_name(""), UNTITLED);
        assert_eq!(clean_name("  \"\"  "), UNTITLED);
    }

    #[test]
    fn prompt_embeds_content() {
        let prompt = build_naming_prompt("The keeper climbed the stairs.");
        assert!(prompt.contains("Text content:\nThe keeper climbed the stairs.\n"));
        assert!(prompt.ends_with("Document name:"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "\u{e9}".repeat(10);
        assert_eq!(truncate_chars(&text, 3), "\u{e9}\u{e9}\u{e9}");
        assert_eq!(truncate_chars("short", 100), "short");
    }
}
