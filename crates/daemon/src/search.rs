// Document search: embedding similarity or keyword counts, chosen by the
// `search.embeddings` setting.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    /// Empty query: every document, newest first.
    None,
    Embeddings,
    Keyword,
}

/// A ranked document. Exactly one of the scores is set, matching the
/// search type; both are absent for an empty query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: Uuid,
    pub name: String,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurrence_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResults {
    pub documents: Vec<SearchHit>,
    pub search_type: SearchType,
}

/// Rank every indexed document against `query`. Nothing is filtered out;
/// non-matching documents just score 0.
pub async fn search(store: &DocumentStore, query: &str) -> SearchResults {
    let query = query.trim();
    if query.is_empty() {
        let documents = store
            .list_all()
            .await
            .into_iter()
            .map(|summary| SearchHit {
                id: summary.id,
                name: summary.name,
                updated_at: summary.updated_at,
                created_at: summary.created_at,
                similarity_score: None,
                occurrence_count: None,
            })
            .collect();
        return SearchResults { documents, search_type: SearchType::None };
    }

    if store.config().embeddings_search() {
        embeddings_search(store, query).await
    } else {
        keyword_search(store, query).await
    }
}

async fn embeddings_search(store: &DocumentStore, query: &str) -> SearchResults {
    let query_embedding = store.embedder().embed(query);
    debug!(has_embedding = query_embedding.is_some(), "query embedding computed");

    let mut documents: Vec<SearchHit> = store
        .all_metadata(false)
        .await
        .into_iter()
        .map(|metadata| {
            let score = match &query_embedding {
                Some(query) => {
                    let content = metadata.content_embedding.as_deref().map_or(0.0, |e| cosine_similarity(query, e));
                    let name = metadata.name_embedding.as_deref().map_or(0.0, |e| cosine_similarity(query, e));
                    content.max(name)
                }
                None => 0.0,
            };
            SearchHit {
                id: metadata.id,
                name: metadata.name,
                updated_at: metadata.updated_at,
                created_at: metadata.created_at,
                similarity_score: Some(score),
                occurrence_count: None,
            }
        })
        .collect();

    documents.sort_by(|a, b| score_of(b).total_cmp(&score_of(a)));
    SearchResults { documents, search_type: SearchType::Embeddings }
}

async fn keyword_search(store: &DocumentStore, query: &str) -> SearchResults {
    let needle = query.to_lowercase();

    let mut documents: Vec<SearchHit> = store
        .all_metadata(true)
        .await
        .into_iter()
        .map(|metadata| {
            let content = metadata.content.as_deref().unwrap_or_default();
            let count = count_occurrences(content, &needle) + count_occurrences(&metadata.name, &needle);
            SearchHit {
                id: metadata.id,
                name: metadata.name,
                updated_at: metadata.updated_at,
                created_at: metadata.created_at,
                similarity_score: None,
                occurrence_count: Some(count),
            }
        })
        .collect();

    documents.sort_by(|a, b| match b.occurrence_count.cmp(&a.occurrence_count) {
        Ordering::Equal => b.updated_at.cmp(&a.updated_at),
        other => other,
    });
    SearchResults { documents, search_type: SearchType::Keyword }
}

fn score_of(hit: &SearchHit) -> f32 {
    hit.similarity_score.unwrap_or_default()
}

/// Non-overlapping, case-insensitive occurrences. `needle` is lowercase.
fn count_occurrences(haystack: &str, needle: &str) -> usize {
    haystack.to_lowercase().matches(needle).count()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::config::{AppConfig, ConfigStore};
    use crate::embedding::Embedder;
    use crate::store::backend::MemoryBackend;

    /// Fixed text -> vector table. Unknown text has no embedding.
    struct TableEmbedder(HashMap<&'static str, Vec<f32>>);

    impl Embedder for TableEmbedder {
        fn embed(&self, text: &str) -> Option<Vec<f32>> {
            self.0.get(text).cloned()
        }
    }

    /// Unit vector at cosine `score` from `[1, 0]`.
    fn at(score: f32) -> Vec<f32> {
        vec![score, (1.0 - score * score).sqrt()]
    }

    fn store_with(embeddings: bool, table: HashMap<&'static str, Vec<f32>>) -> (DocumentStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.search.embeddings = embeddings;
        let config = Arc::new(ConfigStore::with_config(dir.path().join("config.toml"), config));
        let store = DocumentStore::new(Arc::new(MemoryBackend::new()), Arc::new(TableEmbedder(table)), config);
        (store, dir)
    }

    #[tokio::test]
    async fn embeddings_rank_by_similarity() {
        let table = HashMap::from([
            ("harbor", vec![1.0, 0.0]),
            ("fog over the harbor", at(0.9)),
            ("a dry desert road", at(0.3)),
            ("boats and gulls", at(0.6)),
        ]);
        let (store, _dir) = store_with(true, table);
        let low = store.create("Desert", "a dry desert road").await;
        let high = store.create("Fog", "fog over the harbor").await;
        let mid = store.create("Boats", "boats and gulls").await;

        let results = search(&store, "harbor").await;
        assert_eq!(results.search_type, SearchType::Embeddings);
        let ids: Vec<_> = results.documents.iter().map(|hit| hit.id).collect();
        assert_eq!(ids, vec![high.id, mid.id, low.id]);

        let top = results.documents[0].similarity_score.unwrap();
        assert!((top - 0.9).abs() < 1e-5);
        assert!(results.documents.iter().all(|hit| hit.occurrence_count.is_none()));
    }

    #[tokio::test]
    async fn name_similarity_counts_when_higher() {
        let table = HashMap::from([
            ("lighthouse", vec![1.0, 0.0]),
            ("Lighthouse Keeper", at(0.8)),
            ("unrelated words", at(0.1)),
            ("other words", at(0.5)),
        ]);
        let (store, _dir) = store_with(true, table);
        let named = store.create("Lighthouse Keeper", "unrelated words").await;
        let plain = store.create("Plain", "other words").await;

        let results = search(&store, "lighthouse").await;
        assert_eq!(results.documents[0].id, named.id);
        assert!((results.documents[0].similarity_score.unwrap() - 0.8).abs() < 1e-5);
        assert_eq!(results.documents[1].id, plain.id);
    }

    #[tokio::test]
    async fn keyword_counts_case_insensitively() {
        let (store, _dir) = store_with(false, HashMap::new());
        let two = store.create("Shore", "The tide came in. TIDE again.").await;
        let three = store.create("Tide tables", "tide, tide").await;
        let none = store.create("Dunes", "sand").await;

        let results = search(&store, "Tide").await;
        assert_eq!(results.search_type, SearchType::Keyword);
        let ranked: Vec<_> =
            results.documents.iter().map(|hit| (hit.id, hit.occurrence_count.unwrap())).collect();
        assert_eq!(ranked, vec![(three.id, 3), (two.id, 2), (none.id, 0)]);
    }

    #[tokio::test]
    async fn keyword_ties_break_on_recency() {
        let (store, _dir) = store_with(false, HashMap::new());
        let older = store.create("A", "moon").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = store.create("B", "moon").await;

        let results = search(&store, "moon").await;
        let ids: Vec<_> = results.documents.iter().map(|hit| hit.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn empty_query_lists_everything() {
        let (store, _dir) = store_with(true, HashMap::new());
        store.create("One", "").await;
        store.create("Two", "text").await;

        let results = search(&store, "   ").await;
        assert_eq!(results.search_type, SearchType::None);
        assert_eq!(results.documents.len(), 2);
        assert!(results.documents.iter().all(|hit| hit.similarity_score.is_none()));
    }

    #[test]
    fn occurrences_do_not_overlap() {
        assert_eq!(count_occurrences("aaaa", "aa"), 2);
        assert_eq!(count_occurrences("Sea SEA sea", "sea"), 3);
        assert_eq!(count_occurrences("", "sea"), 0);
    }
}
