//! Label inference engine: given a free-text advisory summary
//! plus platform, produces a labeled `Analysis` through five tiers -
//! request-level dedup, persistent cache, exact exemplar, model call,
//! fallback - with an explicit, non-exceptional result type at every step.

use crate::error::{Error, Result};
use crate::models::{Analysis, ConfidenceSource, Platform};
use crate::psirt_cache::PsirtCache;
use crate::retriever::{RetrievedExemplar, VectorRetriever};
use crate::taxonomy::TaxonomyStore;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Similarity below which an exemplar is excluded from the few-shot prompt.
const PROMPT_SIMILARITY_FLOOR: f32 = 0.70;
/// Below this, the model path is abandoned for the fallback path.
const FALLBACK_SIMILARITY_FLOOR: f32 = 0.70;
/// Minimum similarity for the fallback path's heuristic guess to be worth
/// offering at all, rather than returning an empty label set.
const HEURISTIC_GUESS_FLOOR: f32 = 0.40;
const DEFAULT_TOP_K: usize = 5;
const MODEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Seam to the external language model. The runtime behind it is out of
/// scope here; only the request/response contract matters.
#[async_trait::async_trait]
pub trait LmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Posts the prompt to a configured endpoint and expects `{"completion":
/// "..."}` back. The LM's own wire contract is out of scope;
/// this is the one concrete shape the service assumes.
pub struct HttpLmClient {
    client: reqwest::Client,
    endpoint: String,
    model_name: String,
}

impl HttpLmClient {
    pub fn new(client: reqwest::Client, endpoint: String, model_name: String) -> Self {
        Self { client, endpoint, model_name }
    }
}

#[async_trait::async_trait]
impl LmClient for HttpLmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            model: &'a str,
            prompt: &'a str,
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            completion: String,
        }
        let response =
            self.client.post(&self.endpoint).json(&Req { model: &self.model_name, prompt }).send().await?;
        let body: Resp = response.json().await?;
        Ok(body.completion)
    }
}

/// Always falls through to the heuristic tier; used when no LM endpoint is
/// configured (developer mode, or a deployment that hasn't wired one up).
pub struct NullLmClient;

#[async_trait::async_trait]
impl LmClient for NullLmClient {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(Error::Upstream("no language model endpoint configured".into()))
    }
}

pub struct InferenceEngine<'a, E: crate::embeddings::Embedder> {
    taxonomy: &'a TaxonomyStore,
    retriever: &'a VectorRetriever<E>,
    cache: &'a PsirtCache,
    lm: &'a dyn LmClient,
    request_dedup: Mutex<HashMap<String, Analysis>>,
}

impl<'a, E: crate::embeddings::Embedder> InferenceEngine<'a, E> {
    pub fn new(
        taxonomy: &'a TaxonomyStore,
        retriever: &'a VectorRetriever<E>,
        cache: &'a PsirtCache,
        lm: &'a dyn LmClient,
    ) -> Self {
        Self { taxonomy, retriever, cache, lm, request_dedup: Mutex::new(HashMap::new()) }
    }

    pub async fn analyze(&self, summary: &str, platform: Platform, advisory_id: Option<&str>) -> Result<Analysis> {
        let dedup_key = dedup_key(summary, platform, advisory_id);

        // Tier 1: request-level dedup.
        if let Some(hit) = self.request_dedup.lock().expect("dedup lock poisoned").get(&dedup_key).cloned() {
            return Ok(hit);
        }

        // Tier 2: persistent cache.
        if let Some(advisory_id) = advisory_id {
            if let Some(entry) = self.cache.get(advisory_id, platform)? {
                let analysis = Analysis {
                    id: Uuid::new_v4().to_string(),
                    summary: summary.to_string(),
                    platform,
                    advisory_id: Some(advisory_id.to_string()),
                    labels: entry.labels.clone(),
                    confidence: entry.confidence,
                    confidence_source: ConfidenceSource::Cache,
                    needs_review: entry.needs_review,
                    config_regex: self.regex_for_labels(platform, &entry.labels),
                    show_commands: self.show_commands_for_labels(platform, &entry.labels),
                    timestamp: Utc::now(),
                };
                self.remember(dedup_key, analysis.clone());
                return Ok(analysis);
            }
        }

        // Tier 3: exact exemplar shortcut.
        let top_k = self.retriever.retrieve(summary, platform, advisory_id, DEFAULT_TOP_K)?;
        if let Some(exact) = top_k.iter().find(|h| h.similarity >= 1.0) {
            let labels = self.validated_labels(platform, &exact.exemplar.labels);
            let analysis = self.finish(summary, platform, advisory_id, labels, 1.0, ConfidenceSource::Exact, false);
            self.remember(dedup_key, analysis.clone());
            self.maybe_cache(&analysis);
            return Ok(analysis);
        }

        // Tier 4: model path, if the retrieved exemplars clear the floor.
        let best_similarity = top_k.iter().map(|h| h.similarity).fold(f32::MIN, f32::max);
        if best_similarity >= FALLBACK_SIMILARITY_FLOOR {
            match self.run_model_path(summary, platform, &top_k).await {
                Ok(Some((labels, confidence))) if !labels.is_empty() => {
                    let analysis =
                        self.finish(summary, platform, advisory_id, labels, confidence, ConfidenceSource::Model, confidence < 0.75);
                    self.remember(dedup_key, analysis.clone());
                    self.maybe_cache(&analysis);
                    return Ok(analysis);
                }
                _ => {} // parse failure or empty labels falls through to tier 5.
            }
        }

        // Tier 5: fallback.
        let analysis = self.fallback(summary, platform, advisory_id, &top_k);
        self.remember(dedup_key, analysis.clone());
        Ok(analysis)
    }

    async fn run_model_path(
        &self,
        summary: &str,
        platform: Platform,
        exemplars: &[RetrievedExemplar],
    ) -> Result<Option<(BTreeSet<String>, f32)>> {
        let prompt = self.build_prompt(summary, platform, exemplars);
        let response = match tokio::time::timeout(MODEL_TIMEOUT, self.lm.complete(&prompt)).await {
            Ok(Ok(text)) => text,
            Ok(Err(_)) | Err(_) => return Ok(None), // upstream error or timeout -> fallback tier.
        };

        let parsed = parse_label_list(&response);
        let validated = self.validated_labels(platform, &parsed);
        if validated.is_empty() {
            return Ok(None);
        }

        Ok(Some((validated, weighted_confidence(exemplars))))
    }

    fn build_prompt(&self, summary: &str, platform: Platform, exemplars: &[RetrievedExemplar]) -> String {
        let mut prompt = String::new();
        prompt.push_str(&format!("Platform: {platform}\n\nLabel catalog:\n"));
        if let Some(entries) = self.taxonomy.entries_for(platform) {
            for (label, entry) in entries {
                prompt.push_str(&format!("- {label}: {}\n", entry.human_definition));
            }
        }
        prompt.push_str("\nExamples:\n");
        for ex in exemplars.iter().filter(|h| h.similarity >= PROMPT_SIMILARITY_FLOOR) {
            prompt.push_str(&format!(
                "Summary: {}\nLabels: {}\n\n",
                ex.exemplar.summary,
                ex.exemplar.labels.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        prompt.push_str(&format!("Query:\nSummary: {summary}\nLabels:"));
        prompt
    }

    fn fallback(
        &self,
        summary: &str,
        platform: Platform,
        advisory_id: Option<&str>,
        exemplars: &[RetrievedExemplar],
    ) -> Analysis {
        let best = exemplars.iter().max_by(|a, b| a.similarity.partial_cmp(&b.similarity).unwrap());
        let (labels, confidence) = match best {
            Some(hit) if hit.similarity >= HEURISTIC_GUESS_FLOOR => {
                (self.validated_labels(platform, &hit.exemplar.labels), hit.similarity)
            }
            _ => (BTreeSet::new(), 0.0),
        };
        self.finish(summary, platform, advisory_id, labels, confidence, ConfidenceSource::Heuristic, true)
    }

    fn finish(
        &self,
        summary: &str,
        platform: Platform,
        advisory_id: Option<&str>,
        labels: BTreeSet<String>,
        confidence: f32,
        source: ConfidenceSource,
        needs_review: bool,
    ) -> Analysis {
        Analysis {
            id: Uuid::new_v4().to_string(),
            summary: summary.to_string(),
            platform,
            advisory_id: advisory_id.map(|s| s.to_string()),
            config_regex: self.regex_for_labels(platform, &labels),
            show_commands: self.show_commands_for_labels(platform, &labels),
            labels,
            confidence,
            confidence_source: source,
            needs_review,
            timestamp: Utc::now(),
        }
    }

    fn validated_labels(&self, platform: Platform, labels: &BTreeSet<String>) -> BTreeSet<String> {
        labels.iter().filter(|l| self.taxonomy.lookup(platform, l).is_some()).cloned().collect()
    }

    fn regex_for_labels(&self, platform: Platform, labels: &BTreeSet<String>) -> Vec<String> {
        labels
            .iter()
            .filter_map(|l| self.taxonomy.lookup(platform, l))
            .flat_map(|entry| entry.config_regex.clone())
            .collect()
    }

    fn show_commands_for_labels(&self, platform: Platform, labels: &BTreeSet<String>) -> Vec<String> {
        labels
            .iter()
            .filter_map(|l| self.taxonomy.lookup(platform, l))
            .flat_map(|entry| entry.show_commands.clone())
            .collect()
    }

    /// Caching policy: only `model` source at `confidence >=
    /// 0.75` with an advisory id present is ever persisted.
    fn maybe_cache(&self, analysis: &Analysis) {
        let Some(advisory_id) = &analysis.advisory_id else { return };
        if analysis.confidence_source != ConfidenceSource::Model || analysis.confidence < 0.75 {
            return;
        }
        let entry = crate::models::PsirtCacheEntry {
            advisory_id: advisory_id.clone(),
            platform: analysis.platform,
            labels: analysis.labels.clone(),
            confidence: analysis.confidence,
            confidence_source: analysis.confidence_source,
            needs_review: analysis.needs_review,
            timestamp: analysis.timestamp,
        };
        let _ = self.cache.put_if_eligible(&entry);
    }

    fn remember(&self, key: String, analysis: Analysis) {
        let mut dedup = self.request_dedup.lock().expect("dedup lock poisoned");
        if dedup.len() > 4096 {
            dedup.clear();
        }
        dedup.insert(key, analysis);
    }
}

fn dedup_key(summary: &str, platform: Platform, advisory_id: Option<&str>) -> String {
    format!("{}\u{1}{}\u{1}{}", platform.as_str(), advisory_id.unwrap_or(""), summary)
}

/// Parses a model response into a label set. The contract with the LM is a
/// comma/newline-separated list of label ids (e.g. "MGMT_SSH_HTTP,
/// SEC_CoPP"); anything the model emits that isn't a bare token is ignored
/// here and filtered against the taxonomy by the caller regardless.
fn parse_label_list(response: &str) -> BTreeSet<String> {
    response
        .split(|c: char| c == ',' || c == '\n' || c.is_whitespace())
        .map(|s| s.trim().trim_matches(|c: char| !c.is_alphanumeric() && c != '_'))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Average similarity of the retrieved exemplars, weighted toward the top.
/// Weight `1/(rank+1)`, normalized.
fn weighted_confidence(exemplars: &[RetrievedExemplar]) -> f32 {
    if exemplars.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f32> = exemplars.iter().map(|h| h.similarity).collect();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for (rank, similarity) in sorted.iter().enumerate() {
        let weight = 1.0 / (rank as f32 + 1.0);
        weighted_sum += similarity * weight;
        weight_total += weight;
    }
    (weighted_sum / weight_total).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::models::{LabeledExemplar, Platform};
    use crate::vector_store::SqliteVectorStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubLm {
        response: String,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LmClient for StubLm {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    struct FailingLm;
    #[async_trait::async_trait]
    impl LmClient for FailingLm {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Err(crate::error::Error::Upstream("model unavailable".into()))
        }
    }

    fn taxonomy() -> TaxonomyStore {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"{"APP_IOx": {"human_definition":"IOx app hosting","domain":"app-hosting","config_regex":["^iox$","^app-hosting"],"show_commands":["show iox"]}}"#;
        for platform in Platform::all() {
            std::fs::write(dir.path().join(format!("{}.json", platform.as_str())), json).unwrap();
        }
        TaxonomyStore::load_from_dir(dir.path()).unwrap()
    }

    fn retriever_with_exemplar() -> VectorRetriever<HashingEmbedder> {
        let r = VectorRetriever::new(SqliteVectorStore::new_in_memory().unwrap(), HashingEmbedder::new());
        r.load_corpus(&[LabeledExemplar {
            id: "cisco-sa-iox-dos-95Fqnf7b".into(),
            platform: Platform::IosXe,
            summary: "A vulnerability in the IOx application hosting subsystem of Cisco IOS XE".into(),
            labels: ["APP_IOx".to_string()].into_iter().collect(),
        }])
        .unwrap();
        r
    }

    #[tokio::test]
    async fn exact_advisory_id_hit_short_circuits_model_call() {
        let tax = taxonomy();
        let retriever = retriever_with_exemplar();
        let cache = PsirtCache::open_in_memory().unwrap();
        let lm = StubLm { response: "APP_IOx".into(), calls: AtomicUsize::new(0) };
        let engine = InferenceEngine::new(&tax, &retriever, &cache, &lm);

        let analysis = engine
            .analyze(
                "A vulnerability in the IOx application hosting subsystem of Cisco IOS XE Software",
                Platform::IosXe,
                Some("cisco-sa-iox-dos-95Fqnf7b"),
            )
            .await
            .unwrap();

        assert_eq!(analysis.confidence_source, ConfidenceSource::Exact);
        assert_eq!(analysis.confidence, 1.0);
        assert_eq!(lm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_call_with_same_advisory_id_hits_persistent_cache() {
        let tax = taxonomy();
        let retriever = VectorRetriever::new(SqliteVectorStore::new_in_memory().unwrap(), HashingEmbedder::new());
        // No exemplar on file -> forces the model path on the first call.
        retriever
            .load_corpus(&[LabeledExemplar {
                id: "other".into(),
                platform: Platform::IosXe,
                summary: "A vulnerability in the IOx application hosting subsystem of Cisco IOS XE".into(),
                labels: ["APP_IOx".to_string()].into_iter().collect(),
            }])
            .unwrap();
        let cache = PsirtCache::open_in_memory().unwrap();
        let lm = StubLm { response: "APP_IOx".into(), calls: AtomicUsize::new(0) };
        let engine = InferenceEngine::new(&tax, &retriever, &cache, &lm);

        let first = engine
            .analyze("A vulnerability in the IOx application hosting subsystem", Platform::IosXe, Some("cisco-sa-iox-dos-95Fqnf7b"))
            .await
            .unwrap();
        assert_eq!(first.confidence_source, ConfidenceSource::Model);
        assert!(first.confidence >= 0.75);

        let calls_before_second = lm.calls.load(Ordering::SeqCst);
        let second = engine
            .analyze("A vulnerability in the IOx application hosting subsystem", Platform::IosXe, Some("cisco-sa-iox-dos-95Fqnf7b"))
            .await
            .unwrap();
        assert_eq!(second.labels, first.labels);
        assert_eq!(lm.calls.load(Ordering::SeqCst), calls_before_second);
    }

    #[tokio::test]
    async fn model_failure_falls_back_and_is_not_cached() {
        let tax = taxonomy();
        let retriever = retriever_with_exemplar();
        let cache = PsirtCache::open_in_memory().unwrap();
        let lm = FailingLm;
        let engine = InferenceEngine::new(&tax, &retriever, &cache, &lm);

        // Low-similarity query so the exact-id shortcut doesn't apply and we
        // reach the model path, which then fails.
        let analysis = engine.analyze("completely unrelated query text", Platform::IosXe, None).await.unwrap();
        assert!(analysis.needs_review);
        assert!(cache.get("nonexistent", Platform::IosXe).unwrap().is_none());
    }

    #[test]
    fn weighted_confidence_favors_top_result() {
        let hits = vec![
            RetrievedExemplar {
                exemplar: LabeledExemplar { id: "a".into(), platform: Platform::IosXe, summary: "".into(), labels: BTreeSet::new() },
                similarity: 0.9,
            },
            RetrievedExemplar {
                exemplar: LabeledExemplar { id: "b".into(), platform: Platform::IosXe, summary: "".into(), labels: BTreeSet::new() },
                similarity: 0.1,
            },
        ];
        let confidence = weighted_confidence(&hits);
        assert!(confidence > 0.5);
    }

    #[test]
    fn parse_label_list_splits_on_commas_and_whitespace() {
        let labels = parse_label_list("APP_IOx, MGMT_SSH_HTTP\nSEC_CoPP");
        assert_eq!(labels.len(), 3);
        assert!(labels.contains("APP_IOx"));
    }
}
