// In-flight generation requests, keyed by generation ID.
//
// Entries live from `submit` until the orchestrator's terminal cleanup.
// Cancellation only flips the token so a running stream can still observe it.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::seed::SEED_PROMPT;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: Uuid,
    pub prompt: String,
    pub document_id: Option<Uuid>,
    pub is_seed: bool,
    pub cancel: CancellationToken,
}

impl GenerationRequest {
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("generation not found")]
    NotFound,
    #[error("generation {0} is already streaming")]
    AlreadyStreaming(Uuid),
    #[error("document {document_id} already has generation {generation_id} streaming into it")]
    DocumentBusy { document_id: Uuid, generation_id: Uuid },
}

#[derive(Debug, Default)]
struct RegistryState {
    generations: HashMap<Uuid, GenerationRequest>,
    /// document ID -> the generation currently streaming into it.
    attached: HashMap<Uuid, Uuid>,
    /// Generations that have been attached to a stream.
    streaming: HashSet<Uuid>,
}

#[derive(Debug, Default)]
pub struct GenerationRegistry {
    state: Mutex<RegistryState>,
}

impl GenerationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generation. A blank prompt becomes a seed generation.
    pub fn submit(&self, prompt: &str, document_id: Option<Uuid>) -> Uuid {
        let is_seed = prompt.trim().is_empty();
        let request = GenerationRequest {
            id: Uuid::new_v4(),
            prompt: if is_seed { SEED_PROMPT.to_string() } else { prompt.to_string() },
            document_id,
            is_seed,
            cancel: CancellationToken::new(),
        };
        let id = request.id;
        self.lock().generations.insert(id, request);
        info!(generation_id = %id, is_seed, "generation submitted");
        id
    }

    /// Mark `id` cancelled. The entry stays until cleanup.
    pub fn cancel(&self, id: Uuid) -> bool {
        let state = self.lock();
        match state.generations.get(&id) {
            Some(request) => {
                request.cancel.cancel();
                info!(generation_id = %id, "generation cancelled");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<GenerationRequest> {
        self.lock().generations.get(&id).cloned()
    }

    /// Drop `id` and release its document, if attached.
    pub fn remove(&self, id: Uuid) -> Option<GenerationRequest> {
        let mut state = self.lock();
        let removed = state.generations.remove(&id)?;
        state.streaming.remove(&id);
        if let Some(document_id) = removed.document_id {
            if state.attached.get(&document_id) == Some(&id) {
                state.attached.remove(&document_id);
            }
        }
        debug!(generation_id = %id, "generation removed");
        Some(removed)
    }

    /// Start streaming `id`, claiming its target document. Each generation
    /// attaches at most once, and a document takes one generation at a time.
    pub fn attach(&self, id: Uuid) -> Result<GenerationRequest, AttachError> {
        let mut state = self.lock();
        let request = state.generations.get(&id).cloned().ok_or(AttachError::NotFound)?;
        if state.streaming.contains(&id) {
            return Err(AttachError::AlreadyStreaming(id));
        }
        if let Some(document_id) = request.document_id {
            if let Some(owner) = state.attached.get(&document_id) {
                return Err(AttachError::DocumentBusy { document_id, generation_id: *owner });
            }
            state.attached.insert(document_id, id);
        }
        state.streaming.insert(id);
        Ok(request)
    }

    /// Generation currently attached to `document_id`.
    pub fn attached_to(&self, document_id: Uuid) -> Option<Uuid> {
        self.lock().attached.get(&document_id).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().generations.len()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_stores_active_request() {
        let registry = GenerationRegistry::new();
        let doc = Uuid::new_v4();
        let id = registry.submit("Once upon a time", Some(doc));

        let request = registry.get(id).unwrap();
        assert_eq!(request.prompt, "Once upon a time");
        assert_eq!(request.document_id, Some(doc));
        assert!(!request.is_seed);
        assert!(request.is_active());
    }

    #[test]
    fn blank_prompt_becomes_seed() {
        let registry = GenerationRegistry::new();
        let id = registry.submit("  \n ", None);

        let request = registry.get(id).unwrap();
        assert!(request.is_seed);
        assert_eq!(request.prompt, SEED_PROMPT);
    }

    #[test]
    fn cancel_keeps_entry_and_is_visible_through_clones() {
        let registry = GenerationRegistry::new();
        let id = registry.submit("x", None);
        let held = registry.get(id).unwrap();

        assert!(registry.cancel(id));
        assert!(!held.is_active(), "clone shares the token");
        assert!(registry.get(id).is_some());
        assert!(!registry.cancel(Uuid::new_v4()));
    }

    #[test]
    fn removed_generation_is_not_found() {
        let registry = GenerationRegistry::new();
        let id = registry.submit("x", None);

        assert!(registry.remove(id).is_some());
        assert!(registry.get(id).is_none());
        assert!(!registry.cancel(id));
        assert!(registry.remove(id).is_none());
        assert_eq!(registry.len(), 0);
    }

    // ── Attachment guard ───────────────────────────────────────────

    #[test]
    fn second_generation_on_same_document_is_rejected() {
        let registry = GenerationRegistry::new();
        let doc = Uuid::new_v4();
        let first = registry.submit("a", Some(doc));
        let second = registry.submit("b", Some(doc));

        registry.attach(first).unwrap();
        assert_eq!(
            registry.attach(second).unwrap_err(),
            AttachError::DocumentBusy { document_id: doc, generation_id: first }
        );
    }

    #[test]
    fn remove_releases_document() {
        let registry = GenerationRegistry::new();
        let doc = Uuid::new_v4();
        let first = registry.submit("a", Some(doc));
        let second = registry.submit("b", Some(doc));

        registry.attach(first).unwrap();
        registry.remove(first);
        assert_eq!(registry.attached_to(doc), None);
        assert!(registry.attach(second).is_ok());
    }

    #[test]
    fn generation_attaches_only_once() {
        let registry = GenerationRegistry::new();
        let doc = Uuid::new_v4();
        let with_doc = registry.submit("a", Some(doc));
        let without_doc = registry.submit("b", None);

        registry.attach(with_doc).unwrap();
        registry.attach(without_doc).unwrap();
        assert_eq!(registry.attach(with_doc).unwrap_err(), AttachError::AlreadyStreaming(with_doc));
        assert_eq!(registry.attach(without_doc).unwrap_err(), AttachError::AlreadyStreaming(without_doc));
        assert_eq!(registry.attached_to(doc), Some(with_doc), "rejection keeps the claim");
        assert!(registry.get(with_doc).is_some());
    }

    #[test]
    fn unknown_or_documentless_generations() {
        let registry = GenerationRegistry::new();
        assert_eq!(registry.attach(Uuid::new_v4()).unwrap_err(), AttachError::NotFound);

        let a = registry.submit("a", None);
        let b = registry.submit("b", None);
        assert!(registry.attach(a).is_ok());
        assert!(registry.attach(b).is_ok());
    }
}
