// Application configuration and the document-ID index.
//
// Stored as `<data_dir>/config.toml`; documents live beside it in
// `<data_dir>/documents/`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::generation::provider::{
    ProviderKind, DEFAULT_OPENAI_BASE_URL, OPENROUTER_CHAT_URL, OPENROUTER_COMPLETIONS_URL,
};
use crate::security::{create_private_dir, write_private_atomic};

/// Quiet period before a settings change is written out.
pub const SETTINGS_SAVE_DELAY: Duration = Duration::from_secs(1);

const DATA_DIR_NAME: &str = ".scrivener";
const CONFIG_FILE_NAME: &str = "config.toml";
const DOCUMENTS_DIR_NAME: &str = "documents";

/// Default root for Scrivener state: `~/.scrivener/`.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DATA_DIR_NAME))
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

pub fn documents_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(DOCUMENTS_DIR_NAME)
}

// ── AppConfig ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Known document IDs, in creation order.
    pub documents: Vec<Uuid>,
    pub current_document: Option<Uuid>,
    pub generation: GenerationSettings,
    pub search: SearchSettings,
}

/// Everything a provider needs to build an upstream request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationSettings {
    pub provider: ProviderKind,
    /// Primary API token (OpenRouter).
    pub token: String,
    /// Overrides `token` for the bearer header when set.
    pub custom_api_key: String,
    /// Model id; OpenRouter accepts `model::provider` to pin a sub-provider.
    pub model: String,
    pub endpoint: String,
    pub chat_endpoint: String,
    /// Base URL for the OpenAI-compatible provider.
    pub openai_endpoint: String,
    pub temperature: f64,
    pub min_p: f64,
    pub presence_penalty: f64,
    pub repetition_penalty: f64,
    pub max_tokens: u32,
    /// Send completions as a two-turn chat exchange.
    pub chat_framing: bool,
    pub naming_model: String,
    pub naming_endpoint: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenRouter,
            token: String::new(),
            custom_api_key: String::new(),
            model: "moonshotai/kimi-linear-48b-a3b-instruct".into(),
            endpoint: OPENROUTER_COMPLETIONS_URL.into(),
            chat_endpoint: OPENROUTER_CHAT_URL.into(),
            openai_endpoint: DEFAULT_OPENAI_BASE_URL.into(),
            temperature: 1.0,
            min_p: 0.01,
            presence_penalty: 0.1,
            repetition_penalty: 1.1,
            max_tokens: 500,
            chat_framing: false,
            naming_model: "moonshotai/kimi-k2".into(),
            naming_endpoint: OPENROUTER_COMPLETIONS_URL.into(),
        }
    }
}

impl GenerationSettings {
    /// Bearer credential: the custom key when set, else the primary token.
    pub fn api_key(&self) -> Option<&str> {
        [self.custom_api_key.as_str(), self.token.as_str()].into_iter().find(|key| !key.is_empty())
    }

    /// True when the configured provider cannot run without credentials.
    pub fn missing_required_token(&self) -> bool {
        self.provider.requires_token() && self.token.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchSettings {
    /// Rank by embedding similarity instead of keyword counts.
    pub embeddings: bool,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self { embeddings: true }
    }
}

impl AppConfig {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to `path` atomically, owner-only (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            create_private_dir(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        write_private_atomic(path, contents.as_bytes())?;
        Ok(())
    }
}

/// Partial settings update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    pub custom_api_key: Option<String>,
    pub openai_endpoint: Option<String>,
    pub temperature: Option<f64>,
    pub min_p: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub repetition_penalty: Option<f64>,
    pub max_tokens: Option<u32>,
    pub chat_framing: Option<bool>,
    pub embeddings_search: Option<bool>,
}

impl SettingsPatch {
    pub fn apply(self, config: &mut AppConfig) {
        let generation = &mut config.generation;
        if let Some(provider) = self.provider {
            generation.provider = provider;
        }
        if let Some(model) = self.model {
            generation.model = model;
        }
        if let Some(key) = self.custom_api_key {
            generation.custom_api_key = key;
        }
        if let Some(endpoint) = self.openai_endpoint {
            generation.openai_endpoint = endpoint;
        }
        if let Some(value) = self.temperature {
            generation.temperature = value;
        }
        if let Some(value) = self.min_p {
            generation.min_p = value;
        }
        if let Some(value) = self.presence_penalty {
            generation.presence_penalty = value;
        }
        if let Some(value) = self.repetition_penalty {
            generation.repetition_penalty = value;
        }
        if let Some(value) = self.max_tokens {
            generation.max_tokens = value;
        }
        if let Some(value) = self.chat_framing {
            generation.chat_framing = value;
        }
        if let Some(value) = self.embeddings_search {
            config.search.embeddings = value;
        }
    }
}

// ── ConfigStore ────────────────────────────────────────────────────

/// Live configuration shared by the store, generation and HTTP layers.
///
/// Index changes (create/delete) are written immediately. Settings changes
/// are debounced by [`SETTINGS_SAVE_DELAY`]. Switching the current document
/// is never persisted on its own.
pub struct ConfigStore {
    path: PathBuf,
    inner: Arc<Mutex<AppConfig>>,
    pending_save: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigStore {
    /// Load `path`, or start from defaults and write them out if the file is
    /// missing. An unreadable file also falls back to defaults.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            match AppConfig::load_from(&path) {
                Ok(config) => {
                    info!(path = %path.display(), documents = config.documents.len(), "loaded config");
                    config
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to load config, using defaults");
                    AppConfig::default()
                }
            }
        } else {
            info!(path = %path.display(), "no config file, writing defaults");
            let config = AppConfig::default();
            config.save_to(&path)?;
            config
        };
        if config.generation.token.is_empty() {
            warn!("no API token configured");
        }

        Ok(Self::with_config(path, config))
    }

    /// Wrap an in-memory config without touching disk.
    pub fn with_config(path: impl Into<PathBuf>, config: AppConfig) -> Self {
        Self { path: path.into(), inner: Arc::new(Mutex::new(config)), pending_save: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> AppConfig {
        self.read(Clone::clone)
    }

    pub fn generation(&self) -> GenerationSettings {
        self.read(|config| config.generation.clone())
    }

    pub fn embeddings_search(&self) -> bool {
        self.read(|config| config.search.embeddings)
    }

    pub fn document_ids(&self) -> Vec<Uuid> {
        self.read(|config| config.documents.clone())
    }

    pub fn contains_document(&self, id: Uuid) -> bool {
        self.read(|config| config.documents.contains(&id))
    }

    pub fn current_document(&self) -> Option<Uuid> {
        self.read(|config| config.current_document)
    }

    /// Add `id` to the index, make it current and persist.
    pub fn register_document(&self, id: Uuid) {
        self.write(|config| {
            if !config.documents.contains(&id) {
                config.documents.push(id);
            }
            config.current_document = Some(id);
        });
        self.save_logged();
    }

    /// Drop `id` from the index. If it was current, the first remaining
    /// document becomes current. Persists.
    pub fn remove_document(&self, id: Uuid) {
        self.write(|config| {
            config.documents.retain(|known| *known != id);
            if config.current_document == Some(id) {
                config.current_document = config.documents.first().copied();
            }
        });
        self.save_logged();
    }

    /// Point `current_document` at a known ID. Not persisted.
    pub fn set_current(&self, id: Uuid) -> bool {
        self.write(|config| {
            if config.documents.contains(&id) {
                config.current_document = Some(id);
                true
            } else {
                false
            }
        })
    }

    /// Store a new API token and persist it immediately.
    pub fn set_token(&self, token: String) -> Result<(), ConfigError> {
        self.write(|config| config.generation.token = token);
        self.save_now()
    }

    /// Apply a settings patch and schedule a debounced save.
    pub fn update_settings(&self, patch: SettingsPatch) {
        self.write(|config| patch.apply(config));
        self.schedule_save();
    }

    pub fn save_now(&self) -> Result<(), ConfigError> {
        let config = self.snapshot();
        config.save_to(&self.path)
    }

    /// Write out any settings change still waiting for its debounce.
    pub fn flush_pending(&self) {
        let pending = self.pending_save.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = pending {
            if !handle.is_finished() {
                handle.abort();
                self.save_logged();
            }
        }
    }

    /// Cancel-and-replace the pending settings save. Must run inside a
    /// tokio runtime.
    fn schedule_save(&self) {
        let mut pending = self.pending_save.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.take() {
            previous.abort();
        }

        let path = self.path.clone();
        let inner = Arc::clone(&self.inner);
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(SETTINGS_SAVE_DELAY).await;
            let config = inner.lock().unwrap_or_else(PoisonError::into_inner).clone();
            match config.save_to(&path) {
                Ok(()) => info!(path = %path.display(), "settings saved"),
                Err(e) => error!(path = %path.display(), error = %e, "failed to save settings"),
            }
        }));
    }

    fn save_logged(&self) {
        if let Err(e) = self.save_now() {
            error!(path = %self.path.display(), error = %e, "failed to save config");
        }
    }

    fn read<T>(&self, f: impl FnOnce(&AppConfig) -> T) -> T {
        f(&self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<T>(&self, f: impl FnOnce(&mut AppConfig) -> T) -> T {
        f(&mut self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
