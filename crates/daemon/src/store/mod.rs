// Document store: in-memory cache with debounced write-back to a backend.
//
// Every cache mutation and every disk transition happens under one async
// lock. Edits land in the cache synchronously; the write scheduler decides
// when they reach the backend. Embeddings are computed outside the lock.

pub mod backend;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use scrivener_common::types::{Document, DocumentMetadata, DocumentSummary, UNTITLED};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::backend::{BackendError, DocumentBackend};
use self::scheduler::{WriteDecision, WriteScheduler};
use crate::config::ConfigStore;
use crate::embedding::Embedder;

/// Content length change (in characters) above which the content embedding
/// is recomputed. Smaller edits keep the previous embedding.
pub const EMBEDDING_REFRESH_THRESHOLD: usize = 100;

type Cache = HashMap<Uuid, Document>;

pub struct DocumentStore {
    cache: Mutex<Cache>,
    scheduler: WriteScheduler,
    backend: Arc<dyn DocumentBackend>,
    embedder: Arc<dyn Embedder>,
    config: Arc<ConfigStore>,
}

impl DocumentStore {
    pub fn new(
        backend: Arc<dyn DocumentBackend>,
        embedder: Arc<dyn Embedder>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            scheduler: WriteScheduler::new(),
            backend,
            embedder,
            config,
        }
    }

    pub fn scheduler(&self) -> &WriteScheduler {
        &self.scheduler
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Spawn the write-back driver. It fires due flush and empty-rename
    /// timers until `shutdown` fires or its sender is dropped.
    pub fn spawn_write_back(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let deadline = store.scheduler.next_deadline();
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    _ = sleep_until(deadline) => store.fire_due().await,
                    _ = store.scheduler.armed() => {}
                }
            }
            debug!("write-back driver stopped");
        })
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Create a document, write it out immediately, register it in the
    /// index and make it current.
    pub async fn create(&self, name: &str, content: &str) -> Document {
        let now = Utc::now();
        let document = Document {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
            content: content.to_string(),
            content_embedding: if content.is_empty() { None } else { self.embedder.embed(content) },
            name_embedding: self.embedder.embed(name),
        };
        let id = document.id;

        let mut cache = self.cache.lock().await;
        cache.insert(id, document.clone());
        self.flush_locked(&cache, id);
        if document.has_blank_content() {
            self.scheduler.arm_empty_rename(id, Instant::now());
        }
        self.config.register_document(id);
        drop(cache);

        info!(doc_id = %id, name = %document.name, "created document");
        document
    }

    /// Cached document, or the stored one (which is then cached). Missing
    /// and unreadable documents are both `None`.
    pub async fn load(&self, id: Uuid) -> Option<Document> {
        let mut cache = self.cache.lock().await;
        self.ensure_cached(&mut cache, id).then(|| cache.get(&id).cloned()).flatten()
    }

    /// Replace the content of `id`. Identical content is a no-op.
    pub async fn update_content(&self, id: Uuid, content: &str) -> Option<Document> {
        let refresh_embedding = {
            let mut cache = self.cache.lock().await;
            if !self.ensure_cached(&mut cache, id) {
                return None;
            }
            let document = cache.get(&id)?;
            if document.content == content {
                debug!(doc_id = %id, "content unchanged");
                return Some(document.clone());
            }
            let length_change = document.content.chars().count().abs_diff(content.chars().count());
            length_change > EMBEDDING_REFRESH_THRESHOLD || document.content_embedding.is_none()
        };

        // Embedding may load the model, so it runs without the cache lock.
        let embedding = refresh_embedding.then(|| self.embedder.embed(content));

        let mut cache = self.cache.lock().await;
        let now = Instant::now();
        let document = cache.get_mut(&id)?;
        document.content = content.to_string();
        document.touch(Utc::now());
        if let Some(embedding) = embedding {
            document.content_embedding = embedding;
            debug!(doc_id = %id, "recomputed content embedding");
        }

        if document.has_blank_content() {
            self.scheduler.arm_empty_rename(id, now);
        } else {
            self.scheduler.cancel_empty_rename(id);
        }

        let updated = document.clone();
        self.schedule_write_locked(&cache, id, now);
        Some(updated)
    }

    /// Rename `id`. A blank name leaves the name alone but still bumps
    /// `updated_at`.
    pub async fn update_metadata(&self, id: Uuid, name: &str) -> Option<Document> {
        let name_embedding = self.embed_name(name);
        let mut cache = self.cache.lock().await;
        if !self.ensure_cached(&mut cache, id) {
            return None;
        }
        self.rename_locked(&mut cache, id, name, name_embedding)
    }

    /// Remove `id` from the cache, the backend and the index.
    pub async fn delete(&self, id: Uuid) -> bool {
        let mut cache = self.cache.lock().await;
        if !self.config.contains_document(id) && !cache.contains_key(&id) {
            return false;
        }

        match self.backend.remove(id) {
            Ok(true) => {}
            Ok(false) => debug!(doc_id = %id, "deleted document had no stored copy"),
            Err(e) => {
                error!(doc_id = %id, error = %e, "failed to delete document");
                return false;
            }
        }

        cache.remove(&id);
        self.scheduler.forget(id);
        self.config.remove_document(id);
        info!(doc_id = %id, "deleted document");
        true
    }

    pub async fn get_metadata(&self, id: Uuid, include_content: bool) -> Option<DocumentMetadata> {
        let mut cache = self.cache.lock().await;
        if !self.ensure_cached(&mut cache, id) {
            return None;
        }
        cache.get(&id).map(|document| document.metadata(include_content))
    }

    /// Every indexed document, newest edit first.
    pub async fn list_all(&self) -> Vec<DocumentSummary> {
        let mut summaries: Vec<_> =
            self.all_metadata(false).await.into_iter().map(DocumentSummary::from).collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    /// Metadata for every indexed document, in index order.
    pub async fn all_metadata(&self, include_content: bool) -> Vec<DocumentMetadata> {
        let mut cache = self.cache.lock().await;
        let mut metadata = Vec::new();
        for id in self.config.document_ids() {
            if self.ensure_cached(&mut cache, id) {
                if let Some(document) = cache.get(&id) {
                    metadata.push(document.metadata(include_content));
                }
            }
        }
        metadata
    }

    /// Write `id` now, cancelling any pending debounce.
    pub async fn flush_now(&self, id: Uuid) -> bool {
        let cache = self.cache.lock().await;
        self.scheduler.cancel_write(id);
        self.flush_locked(&cache, id)
    }

    /// Write every document that still has a debounced flush outstanding.
    /// Returns how many were written.
    pub async fn flush_pending(&self) -> usize {
        let cache = self.cache.lock().await;
        let mut flushed = 0;
        for id in self.scheduler.pending_writes() {
            self.scheduler.cancel_write(id);
            if self.flush_locked(&cache, id) {
                flushed += 1;
            }
        }
        flushed
    }

    /// Load `ids` into the cache. Returns how many are now cached.
    pub async fn warm(&self, ids: &[Uuid]) -> usize {
        let mut cache = self.cache.lock().await;
        ids.iter().filter(|id| self.ensure_cached(&mut cache, **id)).count()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.config.contains_document(id)
    }

    pub fn current_document(&self) -> Option<Uuid> {
        self.config.current_document()
    }

    /// Move the current pointer to a known document. Not persisted.
    pub fn set_current(&self, id: Uuid) -> bool {
        self.config.set_current(id)
    }

    // ── Timers ─────────────────────────────────────────────────────

    /// Run every flush and empty-rename timer that is due.
    pub async fn fire_due(&self) {
        let renames = {
            let cache = self.cache.lock().await;
            let due = self.scheduler.drain_due(Instant::now());
            for id in due.flush {
                self.flush_locked(&cache, id);
            }
            due.rename
        };
        if renames.is_empty() {
            return;
        }

        let name_embedding = self.embed_name(UNTITLED);
        let mut cache = self.cache.lock().await;
        for id in renames {
            self.rename_if_blank_locked(&mut cache, id, name_embedding.clone());
        }
    }

    fn rename_if_blank_locked(&self, cache: &mut Cache, id: Uuid, name_embedding: Option<Vec<f32>>) {
        let Some(document) = cache.get(&id) else {
            return;
        };
        if document.has_blank_content() && document.name != UNTITLED {
            self.rename_locked(cache, id, UNTITLED, name_embedding);
            info!(doc_id = %id, "renamed empty document to {UNTITLED}");
        }
    }

    fn embed_name(&self, name: &str) -> Option<Vec<f32>> {
        if name.trim().is_empty() {
            None
        } else {
            self.embedder.embed(name)
        }
    }

    // ── Internals (caller holds the cache lock) ────────────────────

    fn ensure_cached(&self, cache: &mut Cache, id: Uuid) -> bool {
        if cache.contains_key(&id) {
            return true;
        }
        match self.backend.read(id) {
            Ok(Some(document)) => {
                debug!(doc_id = %id, "loaded document from backend");
                cache.insert(id, document);
                true
            }
            Ok(None) => {
                warn!(doc_id = %id, "document not found");
                false
            }
            Err(BackendError::Json(e)) => {
                error!(doc_id = %id, error = %e, "stored document is corrupt");
                false
            }
            Err(e) => {
                error!(doc_id = %id, error = %e, "failed to read document");
                false
            }
        }
    }

    fn rename_locked(
        &self,
        cache: &mut Cache,
        id: Uuid,
        name: &str,
        name_embedding: Option<Vec<f32>>,
    ) -> Option<Document> {
        let now = Instant::now();
        let document = cache.get_mut(&id)?;
        if !name.trim().is_empty() {
            document.name = name.to_string();
            document.name_embedding = name_embedding;
        }
        document.touch(Utc::now());
        let updated = document.clone();
        self.schedule_write_locked(cache, id, now);
        Some(updated)
    }

    fn schedule_write_locked(&self, cache: &Cache, id: Uuid, now: Instant) {
        match self.scheduler.schedule_write(id, true, now) {
            WriteDecision::FlushNow => {
                debug!(doc_id = %id, "max write delay reached, flushing now");
                self.flush_locked(cache, id);
            }
            WriteDecision::Deferred(_) => {}
        }
    }

    fn flush_locked(&self, cache: &Cache, id: Uuid) -> bool {
        let Some(document) = cache.get(&id) else {
            return false;
        };
        match self.backend.write(document) {
            Ok(()) => {
                self.scheduler.record_flush(id, Instant::now());
                debug!(doc_id = %id, "document written");
                true
            }
            Err(e) => {
                error!(doc_id = %id, error = %e, "failed to write document");
                false
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
