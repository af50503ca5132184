// Upstream completion providers.
//
// Each provider is a pure function of the current generation settings and
// the prompt, producing the URL, headers, JSON payload and response shape of
// one streaming completion request.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::seed::SEED_STOP_TOKENS;
use super::sse::ResponseShape;
use crate::config::GenerationSettings;

pub const OPENROUTER_COMPLETIONS_URL: &str = "https://openrouter.ai/api/v1/completions";
pub const OPENROUTER_CHAT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const CHUTES_COMPLETIONS_URL: &str = "https://llm.chutes.ai/v1/completions";
pub const DEFAULT_OPENAI_BASE_URL: &str = "http://localhost:8080/v1";

/// Separator that pins an OpenRouter sub-provider: `model::provider`.
const PROVIDER_PIN_SEPARATOR: &str = "::";

const CHAT_FRAMING_SYSTEM: &str = "CLI inputs are indicated by <cmd> tags.";
const CHAT_FRAMING_USER_TURN: &str = "<cmd>cat untitled.log</cmd>";

/// Completion backend, selected explicitly in configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "openrouter")]
    OpenRouter,
    #[serde(rename = "openai")]
    OpenAiCompatible,
    #[serde(rename = "chutes")]
    Chutes,
}

impl ProviderKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenRouter => "openrouter",
            Self::OpenAiCompatible => "openai",
            Self::Chutes => "chutes",
        }
    }

    /// Label used in user-facing error messages.
    pub const fn api_name(self) -> &'static str {
        match self {
            Self::OpenRouter => "OpenRouter API",
            Self::OpenAiCompatible => "OpenAI-compatible API",
            Self::Chutes => "Chutes API",
        }
    }

    /// Local OpenAI-compatible servers usually run without credentials.
    pub const fn requires_token(self) -> bool {
        matches!(self, Self::OpenRouter)
    }
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "openrouter" => Ok(Self::OpenRouter),
            "openai" => Ok(Self::OpenAiCompatible),
            "chutes" => Ok(Self::Chutes),
            other => Err(ProviderError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),
    #[error("API key contains characters that are not valid in an HTTP header")]
    InvalidApiKey,
}

/// A fully-specified upstream streaming request.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub payload: Value,
    pub shape: ResponseShape,
    pub api_name: &'static str,
}

/// Build the streaming request for the configured provider.
pub fn build_request(
    settings: &GenerationSettings,
    prompt: &str,
    is_seed: bool,
) -> Result<UpstreamRequest, ProviderError> {
    let headers = build_headers(settings.api_key())?;
    let provider = settings.provider;

    let (url, payload, shape) = match provider {
        ProviderKind::OpenRouter => openrouter_request(settings, prompt, is_seed),
        ProviderKind::OpenAiCompatible => (
            normalize_completions_url(&settings.openai_endpoint),
            completion_payload(settings, &settings.model, prompt),
            ResponseShape::Plain,
        ),
        ProviderKind::Chutes => (
            CHUTES_COMPLETIONS_URL.to_string(),
            completion_payload(settings, &settings.model, prompt),
            ResponseShape::Plain,
        ),
    };

    Ok(UpstreamRequest { url, headers, payload, shape, api_name: provider.api_name() })
}

/// JSON content type plus an optional bearer token.
pub fn build_headers(api_key: Option<&str>) -> Result<HeaderMap, ProviderError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(key) = api_key {
        let value = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|_| ProviderError::InvalidApiKey)?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

/// Ensure an OpenAI-compatible base URL points at its completions route.
pub fn normalize_completions_url(base_url: &str) -> String {
    if base_url.ends_with("/completions") {
        base_url.to_string()
    } else {
        format!("{}/completions", base_url.trim_end_matches('/'))
    }
}

/// Split `model::provider` into the model id and the pinned sub-provider.
pub fn split_model_pin(model: &str) -> (&str, Option<&str>) {
    match model.split_once(PROVIDER_PIN_SEPARATOR) {
        Some((model, provider)) if !provider.is_empty() => (model, Some(provider)),
        Some((model, _)) => (model, None),
        None => (model, None),
    }
}

fn openrouter_request(
    settings: &GenerationSettings,
    prompt: &str,
    is_seed: bool,
) -> (String, Value, ResponseShape) {
    let (model, pinned) = split_model_pin(&settings.model);

    let (url, mut payload, shape) = if settings.chat_framing {
        (settings.chat_endpoint.clone(), chat_framed_payload(settings, model, prompt), ResponseShape::Chat)
    } else {
        (settings.endpoint.clone(), completion_payload(settings, model, prompt), ResponseShape::Plain)
    };

    if let Value::Object(fields) = &mut payload {
        if is_seed {
            fields.insert("stop".into(), json!(SEED_STOP_TOKENS));
        }
        if let Some(provider) = pinned {
            fields.insert("provider".into(), json!({ "order": [provider], "allow_fallbacks": false }));
        }
    }

    (url, payload, shape)
}

fn completion_payload(settings: &GenerationSettings, model: &str, prompt: &str) -> Value {
    let mut fields = Map::new();
    fields.insert("model".into(), json!(model));
    fields.insert("prompt".into(), json!(prompt));
    fields.insert("temperature".into(), json!(settings.temperature));
    fields.insert("min_p".into(), json!(settings.min_p));
    fields.insert("presence_penalty".into(), json!(settings.presence_penalty));
    fields.insert("repetition_penalty".into(), json!(settings.repetition_penalty));
    fields.insert("max_tokens".into(), json!(settings.max_tokens));
    fields.insert("stream".into(), json!(true));
    Value::Object(fields)
}

/// Present the completion as the assistant's reply in a two-turn chat, so
/// chat-only models continue the text instead of answering it.
fn chat_framed_payload(settings: &GenerationSettings, model: &str, prompt: &str) -> Value {
    json!({
        "model": model,
        "max_tokens": settings.max_tokens,
        "temperature": settings.temperature,
        "system": CHAT_FRAMING_SYSTEM,
        "messages": [
            { "role": "user", "content": CHAT_FRAMING_USER_TURN },
            { "role": "assistant", "content": prompt },
        ],
        "stream": true,
    })
}
