//! Semantic retriever over the labeled exemplar corpus. Wraps
//! the embedder and the sqlite vector store; platform filtering is applied
//! post-retrieve, and an exact advisory-id hit short-circuits scoring
//! entirely (used by the inference engine's exact-exemplar tier).

use crate::embeddings::Embedder;
use crate::error::Result;
use crate::models::{LabeledExemplar, Platform};
use crate::vector_store::SqliteVectorStore;
use serde_json::json;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RetrievedExemplar {
    pub exemplar: LabeledExemplar,
    pub similarity: f32,
}

pub struct VectorRetriever<E: Embedder> {
    store: Mutex<SqliteVectorStore>,
    embedder: E,
}

impl<E: Embedder> VectorRetriever<E> {
    pub fn new(store: SqliteVectorStore, embedder: E) -> Self {
        Self { store: Mutex::new(store), embedder }
    }

    /// Loads the exemplar corpus into the vector store, replacing any prior
    /// contents. Called at startup and by the offline updater's corpus
    /// rebuild signal.
    pub fn load_corpus(&self, exemplars: &[LabeledExemplar]) -> Result<()> {
        let mut store = self.store.lock().expect("vector store lock poisoned");
        store.clear()?;
        for ex in exemplars {
            let embedding = self.embedder.embed(&ex.summary).embedding;
            let metadata = json!({
                "platform": ex.platform.as_str(),
                "summary": ex.summary,
                "labels": ex.labels,
            });
            store.insert(&ex.id, Some(ex.platform.as_str()), &embedding, &metadata)?;
        }
        Ok(())
    }

    /// Top-k nearest exemplars for `text`, restricted to `platform`. If
    /// `advisory_id` names an exemplar already on file, it is returned alone
    /// with `similarity = 1.0`.
    pub fn retrieve(
        &self,
        text: &str,
        platform: Platform,
        advisory_id: Option<&str>,
        k: usize,
    ) -> Result<Vec<RetrievedExemplar>> {
        let store = self.store.lock().expect("vector store lock poisoned");

        if let Some(id) = advisory_id {
            if let Some((_, metadata)) = store.get(id)? {
                if metadata.get("platform").and_then(|p| p.as_str()) == Some(platform.as_str()) {
                    return Ok(vec![RetrievedExemplar {
                        exemplar: exemplar_from_metadata(id, &metadata)?,
                        similarity: 1.0,
                    }]);
                }
            }
        }

        let query = self.embedder.embed(text).embedding;
        let hits = store.search(&query, Some(platform.as_str()), k)?;
        hits.into_iter()
            .map(|hit| {
                Ok(RetrievedExemplar {
                    exemplar: exemplar_from_metadata(&hit.id, &hit.metadata)?,
                    similarity: hit.score,
                })
            })
            .collect()
    }
}

fn exemplar_from_metadata(id: &str, metadata: &serde_json::Value) -> Result<LabeledExemplar> {
    let platform_str = metadata.get("platform").and_then(|p| p.as_str()).unwrap_or("IOS-XE");
    let platform = Platform::parse(platform_str).unwrap_or(Platform::IosXe);
    let summary = metadata.get("summary").and_then(|s| s.as_str()).unwrap_or("").to_string();
    let labels = metadata
        .get("labels")
        .and_then(|l| l.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(|s| s.to_string()).collect())
        .unwrap_or_default();
    Ok(LabeledExemplar { id: id.to_string(), platform, summary, labels })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use std::collections::BTreeSet;

    fn exemplar(id: &str, platform: Platform, summary: &str, labels: &[&str]) -> LabeledExemplar {
        LabeledExemplar {
            id: id.to_string(),
            platform,
            summary: summary.to_string(),
            labels: labels.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        }
    }

    #[test]
    fn retrieve_filters_by_platform() {
        let retriever = VectorRetriever::new(SqliteVectorStore::new_in_memory().unwrap(), HashingEmbedder::new());
        retriever
            .load_corpus(&[
                exemplar("a", Platform::IosXe, "iox application hosting subsystem", &["APP_IOx"]),
                exemplar("b", Platform::NxOs, "iox application hosting subsystem", &["APP_IOx"]),
            ])
            .unwrap();

        let hits = retriever.retrieve("iox hosting vulnerability", Platform::IosXe, None, 5).unwrap();
        assert!(hits.iter().all(|h| h.exemplar.platform == Platform::IosXe));
        assert!(hits.iter().any(|h| h.exemplar.id == "a"));
    }

    #[test]
    fn exact_advisory_id_shortcut_returns_similarity_one() {
        let retriever = VectorRetriever::new(SqliteVectorStore::new_in_memory().unwrap(), HashingEmbedder::new());
        retriever
            .load_corpus(&[exemplar("cisco-sa-iox-dos-95Fqnf7b", Platform::IosXe, "iox summary", &["APP_IOx"])])
            .unwrap();

        let hits = retriever
            .retrieve("unrelated text", Platform::IosXe, Some("cisco-sa-iox-dos-95Fqnf7b"), 5)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].similarity, 1.0);
    }

    #[test]
    fn missing_advisory_id_falls_back_to_similarity_search() {
        let retriever = VectorRetriever::new(SqliteVectorStore::new_in_memory().unwrap(), HashingEmbedder::new());
        retriever
            .load_corpus(&[exemplar("a", Platform::IosXe, "aaa radius server group ISE", &["MGMT_AAA"])])
            .unwrap();

        let hits = retriever.retrieve("aaa radius server group", Platform::IosXe, Some("nonexistent"), 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].similarity < 1.0 || hits[0].similarity >= -1.0);
    }
}
