use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{config_path, documents_dir, ConfigStore};
use crate::embedding::{Embedder, Model2VecEmbedder};
use crate::generation::upstream::build_client;
use crate::http::{self, AppState};
use crate::naming::{CompletionNamer, DocumentNamer};
use crate::security::create_private_dir;
use crate::store::backend::JsonDirBackend;
use crate::store::DocumentStore;

pub const DEFAULT_BIND: &str = "127.0.0.1:5000";

/// On-disk layout under the data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub documents_dir: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self { config_path: config_path(&data_dir), documents_dir: documents_dir(&data_dir), data_dir }
    }
}

/// Open the config and document store under `paths` and wire up every
/// service the HTTP layer needs.
pub async fn build_state(paths: &DataPaths, embedder: Arc<dyn Embedder>) -> Result<AppState> {
    create_private_dir(&paths.data_dir)
        .with_context(|| format!("failed to create data dir `{}`", paths.data_dir.display()))?;

    let config = Arc::new(ConfigStore::open(&paths.config_path).context("failed to open config")?);
    let backend = Arc::new(
        JsonDirBackend::new(&paths.documents_dir)
            .with_context(|| format!("failed to open documents dir `{}`", paths.documents_dir.display()))?,
    );

    let store = Arc::new(DocumentStore::new(backend, embedder, Arc::clone(&config)));
    let known = config.document_ids();
    let cached = store.warm(&known).await;
    info!(cached, known = known.len(), "document cache warmed");

    let client = build_client().context("failed to build http client")?;
    let namer: Arc<dyn DocumentNamer> = Arc::new(CompletionNamer::new(client.clone(), Arc::clone(&config)));
    Ok(AppState::new(store, client, namer))
}

/// Load the model off the async threads so the first search is fast.
fn preload_embedder(embedder: Arc<Model2VecEmbedder>) {
    tokio::task::spawn_blocking(move || {
        if !embedder.preload() {
            warn!("embeddings model unavailable, semantic search will score 0");
        }
    });
}

/// Serve on `bind` until ctrl-c, then flush pending document and settings
/// writes.
pub async fn run(data_dir: &Path, bind: SocketAddr) -> Result<()> {
    let paths = DataPaths::new(data_dir);
    let embedder = Arc::new(Model2VecEmbedder::new());
    preload_embedder(Arc::clone(&embedder));
    let state = build_state(&paths, embedder).await?;
    let store = Arc::clone(&state.store);
    let config = Arc::clone(&state.config);

    let (shutdown_tx, _) = broadcast::channel(4);
    let write_back = store.spawn_write_back(shutdown_tx.subscribe());
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        let _ = ctrl_c_tx.send(());
    });

    let listener = TcpListener::bind(bind).await.with_context(|| format!("failed to bind `{bind}`"))?;
    let local_addr = listener.local_addr().context("failed to read bound address")?;
    info!(addr = %local_addr, data_dir = %paths.data_dir.display(), "scrivener daemon listening");

    let result = http::serve(listener, state, shutdown_tx.subscribe()).await;

    let _ = shutdown_tx.send(());
    let _ = write_back.await;
    let flushed = store.flush_pending().await;
    config.flush_pending();
    info!(flushed, "pending writes flushed");

    result
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    struct NoEmbedder;

    impl Embedder for NoEmbedder {
        fn embed(&self, _text: &str) -> Option<Vec<f32>> {
            None
        }
    }

    #[test]
    fn data_paths_live_under_data_dir() {
        let paths = DataPaths::new("/tmp/scrivener-test");
        assert_eq!(paths.config_path, PathBuf::from("/tmp/scrivener-test/config.toml"));
        assert_eq!(paths.documents_dir, PathBuf::from("/tmp/scrivener-test/documents"));
    }

    #[tokio::test]
    async fn build_state_creates_layout_and_default_config() {
        let tmp = TempDir::new().unwrap();
        let paths = DataPaths::new(tmp.path().join("data"));

        let state = build_state(&paths, Arc::new(NoEmbedder)).await.unwrap();
        assert!(paths.documents_dir.is_dir());
        assert!(paths.config_path.is_file());
        assert!(state.store.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn documents_survive_a_restart() {
        let tmp = TempDir::new().unwrap();
        let paths = DataPaths::new(tmp.path());

        let created = {
            let state = build_state(&paths, Arc::new(NoEmbedder)).await.unwrap();
            state.store.create("Harbor", "").await
        };

        let state = build_state(&paths, Arc::new(NoEmbedder)).await.unwrap();
        let loaded = state.store.load(created.id).await.unwrap();
        assert_eq!(loaded.name, "Harbor");
        assert_eq!(state.store.current_document(), Some(created.id));
    }
}
