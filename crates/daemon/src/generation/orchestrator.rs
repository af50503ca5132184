// Drives one generation from upstream request to terminal event.
//
// Pending -> Streaming -> Done | Cancelled | Error. Exactly one terminal
// event is emitted and the registry entry is removed on every exit path.

use std::sync::Arc;
use std::time::Duration;

use scrivener_common::protocol::events::GenerationEvent;
use scrivener_common::types::UNTITLED;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::provider::build_request;
use super::registry::{AttachError, GenerationRegistry, GenerationRequest};
use super::seed::{clean_seed_text, contains_stop_token, SEED_PROMPT};
use super::sse::{SseDecoder, StreamItem};
use super::upstream::{self, GenerationError, ReadOutcome, UpstreamStream, READ_TIMEOUT};
use crate::config::ConfigStore;
use crate::naming::DocumentNamer;
use crate::store::DocumentStore;

/// Buffered events per stream before the relay waits on the client.
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Pending,
    Streaming,
    Done,
    Cancelled,
    Error,
}

pub struct StreamOrchestrator {
    client: reqwest::Client,
    registry: Arc<GenerationRegistry>,
    store: Arc<DocumentStore>,
    config: Arc<ConfigStore>,
    namer: Arc<dyn DocumentNamer>,
    read_timeout: Duration,
}

impl StreamOrchestrator {
    pub fn new(
        client: reqwest::Client,
        registry: Arc<GenerationRegistry>,
        store: Arc<DocumentStore>,
        config: Arc<ConfigStore>,
        namer: Arc<dyn DocumentNamer>,
    ) -> Self {
        Self { client, registry, store, config, namer, read_timeout: READ_TIMEOUT }
    }

    /// Bound on every upstream read, including the wait for response headers.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<GenerationRegistry> {
        &self.registry
    }

    /// Run generation `id` on its own task and return its event stream.
    pub fn start(self: &Arc<Self>, id: Uuid) -> mpsc::Receiver<GenerationEvent> {
        let (events, receiver) = mpsc::channel(EVENT_BUFFER);
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let state = orchestrator.run(id, events).await;
            debug!(generation_id = %id, ?state, "generation task finished");
        });
        receiver
    }

    /// Drive generation `id` to a terminal state, sending events to
    /// `events`. A closed receiver counts as cancellation.
    pub async fn run(&self, id: Uuid, events: mpsc::Sender<GenerationEvent>) -> GenerationState {
        let request = match self.registry.attach(id) {
            Ok(request) => request,
            Err(AttachError::NotFound) => {
                let _ = events.send(GenerationEvent::Error("Generation not found".into())).await;
                return GenerationState::Error;
            }
            Err(AttachError::AlreadyStreaming(_)) => {
                warn!(generation_id = %id, "generation is already streaming");
                let _ = events.send(GenerationEvent::Error("Generation is already streaming".into())).await;
                return GenerationState::Error;
            }
            Err(busy) => {
                warn!(generation_id = %id, error = %busy, "rejecting concurrent generation");
                let _ = events.send(GenerationEvent::Error(busy.to_string())).await;
                self.registry.remove(id);
                return GenerationState::Error;
            }
        };

        let settings = self.config.generation();
        let api_name = settings.provider.api_name();
        let upstream_request = match build_request(&settings, &request.prompt, request.is_seed) {
            Ok(upstream_request) => upstream_request,
            Err(e) => return self.finish_error(&request, e.into(), api_name, &events).await,
        };

        info!(generation_id = %id, url = %upstream_request.url, provider = %settings.provider, "starting generation");
        let opened = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return self.finish_cancelled(&request, &events).await,
            opened = upstream::open(&self.client, &upstream_request, self.read_timeout) => opened,
        };
        let response = match opened {
            Ok(response) => response,
            Err(e) => return self.finish_error(&request, e, api_name, &events).await,
        };

        let mut stream = UpstreamStream::new(
            Box::pin(response.bytes_stream()),
            SseDecoder::new(upstream_request.shape),
            request.cancel.clone(),
        )
        .with_read_timeout(self.read_timeout);
        let mut seed_text = String::new();

        'read: loop {
            let items = match stream.next_read().await {
                Ok(ReadOutcome::Items(items)) => items,
                Ok(ReadOutcome::End) => break,
                Ok(ReadOutcome::Cancelled) => return self.finish_cancelled(&request, &events).await,
                Err(e) => return self.finish_error(&request, e, api_name, &events).await,
            };

            for item in items {
                if request.cancel.is_cancelled() {
                    return self.finish_cancelled(&request, &events).await;
                }
                let text = match item {
                    StreamItem::Done => break 'read,
                    StreamItem::Delta(text) => text,
                };
                if request.is_seed {
                    seed_text.push_str(&text);
                }
                if events.send(GenerationEvent::Text(text)).await.is_err() {
                    debug!(generation_id = %id, "client disconnected, cancelling");
                    request.cancel.cancel();
                    return self.finish_cancelled(&request, &events).await;
                }
            }
        }

        self.finish_done(&request, &seed_text, &events).await
    }

    /// Non-streaming seed request: read until a stop token shows up and
    /// return the cleaned text.
    pub async fn fetch_seed(&self) -> Result<String, GenerationError> {
        let settings = self.config.generation();
        if settings.missing_required_token() {
            return Err(GenerationError::MissingToken);
        }
        let request = build_request(&settings, SEED_PROMPT, true)?;
        info!(url = %request.url, "requesting seed text");

        let response = upstream::open(&self.client, &request, self.read_timeout).await?;
        let mut stream = UpstreamStream::new(
            Box::pin(response.bytes_stream()),
            SseDecoder::new(request.shape),
            CancellationToken::new(),
        )
        .with_read_timeout(self.read_timeout);

        let mut accumulated = String::new();
        'read: loop {
            match stream.next_read().await? {
                ReadOutcome::End | ReadOutcome::Cancelled => break,
                ReadOutcome::Items(items) => {
                    for item in items {
                        match item {
                            StreamItem::Done => break 'read,
                            StreamItem::Delta(text) => {
                                accumulated.push_str(&text);
                                if contains_stop_token(&accumulated) {
                                    break 'read;
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(clean_seed_text(&accumulated))
    }

    async fn finish_done(
        &self,
        request: &GenerationRequest,
        seed_text: &str,
        events: &mpsc::Sender<GenerationEvent>,
    ) -> GenerationState {
        let mut new_name = None;
        if let Some(document_id) = request.document_id {
            if request.is_seed && !seed_text.is_empty() {
                let cleaned = clean_seed_text(seed_text);
                if self.store.update_content(document_id, &cleaned).await.is_none() {
                    warn!(generation_id = %request.id, doc_id = %document_id, "seed target document not found");
                }
            }
            new_name = self.auto_rename(document_id).await;
            self.store.flush_now(document_id).await;
        }

        self.registry.remove(request.id);
        info!(generation_id = %request.id, renamed = new_name.is_some(), "generation done");

        if let Some(new_name) = new_name {
            let _ = events.send(GenerationEvent::AutoRenamed { new_name }).await;
        }
        let _ = events.send(GenerationEvent::Done).await;
        GenerationState::Done
    }

    async fn finish_cancelled(
        &self,
        request: &GenerationRequest,
        events: &mpsc::Sender<GenerationEvent>,
    ) -> GenerationState {
        let _ = events.send(GenerationEvent::Cancelled).await;
        if let Some(document_id) = request.document_id {
            self.store.flush_now(document_id).await;
        }
        self.registry.remove(request.id);
        info!(generation_id = %request.id, "generation cancelled");
        GenerationState::Cancelled
    }

    async fn finish_error(
        &self,
        request: &GenerationRequest,
        error: GenerationError,
        api_name: &str,
        events: &mpsc::Sender<GenerationEvent>,
    ) -> GenerationState {
        let message = error.user_message(api_name);
        error!(generation_id = %request.id, error = %error, "generation failed");
        let _ = events.send(GenerationEvent::Error(message)).await;
        self.registry.remove(request.id);
        GenerationState::Error
    }

    /// Name an "Untitled" document that now has content. Failures keep the
    /// original name.
    async fn auto_rename(&self, document_id: Uuid) -> Option<String> {
        let document = self.store.load(document_id).await?;
        if document.name != UNTITLED || document.content.is_empty() {
            return None;
        }

        let name = self.namer.name_from_content(&document.content).await;
        if name.is_empty() || name == UNTITLED {
            return None;
        }
        match self.store.update_metadata(document_id, &name).await {
            Some(_) => {
                info!(doc_id = %document_id, name = %name, "auto-renamed document");
                Some(name)
            }
            None => {
                warn!(doc_id = %document_id, "auto-rename target disappeared");
                None
            }
        }
    }
}
