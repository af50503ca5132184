// Durable storage for documents, keyed by ID.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use scrivener_common::types::Document;
use thiserror::Error;
use uuid::Uuid;

use crate::security::{create_private_dir, write_private_atomic};

const DOCUMENT_FILE_EXT: &str = "json";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("document I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("document JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Opaque object store for documents.
pub trait DocumentBackend: Send + Sync {
    /// `Ok(None)` when nothing is stored under `id`.
    fn read(&self, id: Uuid) -> Result<Option<Document>, BackendError>;

    fn write(&self, document: &Document) -> Result<(), BackendError>;

    /// Returns whether anything was removed.
    fn remove(&self, id: Uuid) -> Result<bool, BackendError>;
}

/// One pretty-printed JSON file per document at `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct JsonDirBackend {
    dir: PathBuf,
}

impl JsonDirBackend {
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        create_private_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.{DOCUMENT_FILE_EXT}"))
    }
}

impl DocumentBackend for JsonDirBackend {
    fn read(&self, id: Uuid) -> Result<Option<Document>, BackendError> {
        let bytes = match fs::read(self.path_for(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn write(&self, document: &Document) -> Result<(), BackendError> {
        let bytes = serde_json::to_vec_pretty(document)?;
        write_private_atomic(&self.path_for(document.id), &bytes)?;
        Ok(())
    }

    fn remove(&self, id: Uuid) -> Result<bool, BackendError> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Volatile backend that counts writes. Can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    documents: Mutex<HashMap<Uuid, Document>>,
    writes: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Last persisted version of `id`.
    pub fn stored(&self, id: Uuid) -> Option<Document> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
    }

    pub fn insert(&self, document: Document) {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner).insert(document.id, document);
    }

    /// Make every later operation fail with an I/O error until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(io::Error::other("backend unavailable").into())
        } else {
            Ok(())
        }
    }
}

impl DocumentBackend for MemoryBackend {
    fn read(&self, id: Uuid) -> Result<Option<Document>, BackendError> {
        self.check()?;
        Ok(self.stored(id))
    }

    fn write(&self, document: &Document) -> Result<(), BackendError> {
        self.check()?;
        self.insert(document.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, id: Uuid) -> Result<bool, BackendError> {
        self.check()?;
        Ok(self.documents.lock().unwrap_or_else(PoisonError::into_inner).remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn document(content: &str) -> Document {
        let now = Utc::now();
        Document {
            id: Uuid::new_v4(),
            name: "Harbor".into(),
            created_at: now,
            updated_at: now,
            content: content.into(),
            content_embedding: Some(vec![0.5, 0.5]),
            name_embedding: None,
        }
    }

    #[test]
    fn json_dir_write_then_read() {
        let dir = TempDir::new().unwrap();
        let backend = JsonDirBackend::new(dir.path().join("documents")).unwrap();
        let doc = document("the tide came in");

        backend.write(&doc).unwrap();
        assert!(backend.path_for(doc.id).exists());
        assert_eq!(backend.read(doc.id).unwrap(), Some(doc));
    }

    #[test]
    fn json_dir_missing_document_is_none() {
        let dir = TempDir::new().unwrap();
        let backend = JsonDirBackend::new(dir.path()).unwrap();
        assert!(backend.read(Uuid::new_v4()).unwrap().is_none());
        assert!(!backend.remove(Uuid::new_v4()).unwrap());
    }

    #[test]
    fn json_dir_corrupt_document_is_json_error() {
        let dir = TempDir::new().unwrap();
        let backend = JsonDirBackend::new(dir.path()).unwrap();
        let id = Uuid::new_v4();
        fs::write(backend.path_for(id), b"{\"id\": ").unwrap();

        assert!(matches!(backend.read(id), Err(BackendError::Json(_))));
    }

    #[test]
    fn json_dir_remove_deletes_file() {
        let dir = TempDir::new().unwrap();
        let backend = JsonDirBackend::new(dir.path()).unwrap();
        let doc = document("");
        backend.write(&doc).unwrap();

        assert!(backend.remove(doc.id).unwrap());
        assert!(!backend.path_for(doc.id).exists());
    }

    #[test]
    fn memory_backend_counts_writes_and_fails_on_demand() {
        let backend = MemoryBackend::new();
        let doc = document("x");

        backend.write(&doc).unwrap();
        assert_eq!(backend.write_count(), 1);

        backend.set_failing(true);
        assert!(backend.write(&doc).is_err());
        assert!(backend.read(doc.id).is_err());
        assert_eq!(backend.write_count(), 1);
    }
}
