// HTTP side of a generation: opening the upstream request and reading its
// body as decoded SSE items, with a per-read timeout and prompt cancellation.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::provider::{ProviderError, UpstreamRequest};
use super::sse::{SseDecoder, StreamItem};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum GenerationError {
    /// Non-2xx upstream response, already rendered for the user.
    #[error("{0}")]
    Status(String),
    #[error("upstream timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Transport(String),
    #[error("No token provided")]
    MissingToken,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl GenerationError {
    /// Message sent to the client in an `{error}` event.
    pub fn user_message(&self, api_name: &str) -> String {
        match self {
            Self::Status(message) => message.clone(),
            Self::Timeout => format!("{api_name} timeout - server took too long to respond"),
            Self::Connect(_) => format!("{api_name} connection error - unable to connect to server"),
            Self::Transport(detail) => format!("{api_name} error: {detail}"),
            Self::MissingToken => self.to_string(),
            Self::Provider(e) => format!("{api_name} error: {e}"),
        }
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_connect() {
            Self::Connect(error.to_string())
        } else {
            Self::Transport(error.to_string())
        }
    }
}

/// Human-readable explanation for common upstream status codes.
pub fn status_description(status: u16) -> Option<&'static str> {
    Some(match status {
        401 => "Authentication failed - Check your API token",
        402 => "Insufficient credits - Add more credits to your account",
        403 => "Access forbidden - Your token may not have permission for this model",
        404 => "Model or endpoint not found - Check your configuration",
        408 => "Request timeout - Try with a shorter prompt",
        429 => "Rate limited - Too many requests, please wait and try again",
        502 => "Server unavailable - The model server is down or overloaded",
        503 => "No available provider - Try a different model",
        _ => return None,
    })
}

/// `Error {code}: {description}`, plus the upstream `error.message` (or
/// `error`) detail when the body carries one.
pub fn status_error_message(status: u16, body: &[u8]) -> String {
    let mut message = match status_description(status) {
        Some(description) => format!("Error {status}: {description}"),
        None => format!("Error {status}: Unknown error (status {status})"),
    };

    if let Ok(body) = serde_json::from_slice::<Value>(body) {
        let detail = match body.get("error") {
            Some(Value::Object(error)) => error.get("message").map(render_detail),
            Some(error) => Some(render_detail(error)),
            None => None,
        };
        if let Some(detail) = detail {
            message.push_str(": ");
            message.push_str(&detail);
        }
    }
    message
}

fn render_detail(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Shared client for upstream completions.
pub fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT).build()
}

/// POST `request` and return the response once it is known to be 2xx.
/// Waiting for the response head counts as a read and is bounded by
/// `read_timeout`.
pub async fn open(
    client: &reqwest::Client,
    request: &UpstreamRequest,
    read_timeout: Duration,
) -> Result<reqwest::Response, GenerationError> {
    let send = client.post(&request.url).headers(request.headers.clone()).json(&request.payload).send();
    let response = tokio::time::timeout(read_timeout, send).await.map_err(|_| GenerationError::Timeout)??;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = match tokio::time::timeout(read_timeout, response.bytes()).await {
        Ok(Ok(bytes)) => bytes.to_vec(),
        _ => Vec::new(),
    };
    Err(GenerationError::Status(status_error_message(status.as_u16(), &body)))
}

/// Result of one read from the upstream body.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Items decoded from this read. May be empty; a trailing
    /// [`StreamItem::Done`] ends the stream.
    Items(Vec<StreamItem>),
    /// The cancellation token fired before or during the read.
    Cancelled,
    /// The body ended.
    End,
}

/// Upstream body decoded into SSE items one read at a time.
pub struct UpstreamStream<S> {
    body: S,
    decoder: SseDecoder,
    cancel: CancellationToken,
    read_timeout: Duration,
    ended: bool,
}

impl<S, B, E> UpstreamStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<GenerationError>,
{
    pub fn new(body: S, decoder: SseDecoder, cancel: CancellationToken) -> Self {
        Self { body, decoder, cancel, read_timeout: READ_TIMEOUT, ended: false }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Wait for the next read. Cancellation is checked first and also
    /// interrupts a read that is still pending.
    pub async fn next_read(&mut self) -> Result<ReadOutcome, GenerationError> {
        if self.cancel.is_cancelled() {
            return Ok(ReadOutcome::Cancelled);
        }
        if self.ended {
            return Ok(ReadOutcome::End);
        }

        let read = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(ReadOutcome::Cancelled),
            read = tokio::time::timeout(self.read_timeout, self.body.next()) => read,
        };

        match read {
            Err(_) => Err(GenerationError::Timeout),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(Some(Ok(chunk))) => {
                let items = self.decoder.push(chunk.as_ref());
                self.ended = self.decoder.is_finished();
                Ok(ReadOutcome::Items(items))
            }
            Ok(None) => {
                self.ended = true;
                let tail = self.decoder.finish();
                if tail.is_empty() {
                    Ok(ReadOutcome::End)
                } else {
                    Ok(ReadOutcome::Items(tail))
                }
            }
        }
    }
}
