// Text embeddings for semantic search.
//
// The default embedder runs Model2Vec static embeddings locally; encoding is
// a table lookup plus averaging, cheap enough to run inline with an edit.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use model2vec_rs::model::StaticModel;
use tracing::{debug, error, info};

pub const DEFAULT_MODEL: &str = "minishlab/potion-base-8M";

/// Above this many characters only the head and tail are embedded.
const SAMPLE_THRESHOLD: usize = 50_000;
const SAMPLE_SPAN: usize = 2_000;
const SAMPLE_JOINER: &str = " ... ";
const MEDIUM_LIMIT: usize = 8_000;
const SMALL_LIMIT: usize = 5_000;

/// How long a failed model load is remembered before loading again.
pub const MODEL_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Text to vector. `None` means no embedding could be produced.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

/// Cosine similarity in `[-1, 1]`. Empty, zero or mismatched vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot_product = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let magnitude = (norm_a * norm_b).sqrt();
    if magnitude == 0.0 {
        0.0
    } else {
        dot_product / magnitude
    }
}

/// Collapse whitespace and bound the length of text handed to the model.
/// Returns `None` for blank input.
pub fn prepare_text(text: &str) -> Option<String> {
    let clean = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if clean.is_empty() {
        return None;
    }

    let len = clean.chars().count();
    let prepared = if len > SAMPLE_THRESHOLD {
        let head: String = clean.chars().take(SAMPLE_SPAN).collect();
        let tail: String = clean.chars().skip(len - SAMPLE_SPAN).collect();
        debug!(chars = len, "sampling head and tail of large document for embedding");
        format!("{head}{SAMPLE_JOINER}{tail}")
    } else if len > MEDIUM_LIMIT {
        clean.chars().take(MEDIUM_LIMIT).collect()
    } else if len > SMALL_LIMIT {
        clean.chars().take(SMALL_LIMIT).collect()
    } else {
        clean
    };
    Some(prepared)
}

enum LoadState {
    Unloaded,
    Loaded(Arc<StaticModel>),
    Failed { at: Instant },
}

impl LoadState {
    fn ready_to_load(&self, now: Instant) -> bool {
        match self {
            Self::Unloaded => true,
            Self::Loaded(_) => false,
            Self::Failed { at } => now.saturating_duration_since(*at) >= MODEL_RETRY_DELAY,
        }
    }
}

/// Model2Vec embedder. The model is loaded on first use. After a failed
/// load, calls return `None` until `MODEL_RETRY_DELAY` has passed.
pub struct Model2VecEmbedder {
    model_name: String,
    state: Mutex<LoadState>,
}

impl Model2VecEmbedder {
    pub fn new() -> Self {
        Self::with_model(DEFAULT_MODEL)
    }

    pub fn with_model(model_name: impl Into<String>) -> Self {
        Self { model_name: model_name.into(), state: Mutex::new(LoadState::Unloaded) }
    }

    /// Load the model now. Returns whether a model is available.
    pub fn preload(&self) -> bool {
        self.model().is_some()
    }

    fn model(&self) -> Option<Arc<StaticModel>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let LoadState::Loaded(model) = &*state {
            return Some(Arc::clone(model));
        }
        if !state.ready_to_load(Instant::now()) {
            debug!(model = %self.model_name, "embeddings model unavailable, waiting before retry");
            return None;
        }

        info!(model = %self.model_name, "loading embeddings model");
        match StaticModel::from_pretrained(&self.model_name, None, None, None) {
            Ok(model) => {
                info!(model = %self.model_name, "embeddings model loaded");
                let model = Arc::new(model);
                *state = LoadState::Loaded(Arc::clone(&model));
                Some(model)
            }
            Err(e) => {
                error!(model = %self.model_name, error = %e, "failed to load embeddings model");
                *state = LoadState::Failed { at: Instant::now() };
                None
            }
        }
    }
}

impl Default for Model2VecEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder for Model2VecEmbedder {
    fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let prepared = prepare_text(text)?;
        let model = self.model()?;
        let embedding = model.encode(&[prepared]).into_iter().next();
        if embedding.is_none() {
            error!("embeddings model returned no vector");
        }
        embedding
    }
}
