//! Composition root. Built once at startup and passed into
//! every handler via `web::Data`; no process-wide singletons. The vector
//! retriever is held behind a `RwLock` so an offline-update rebuild can swap
//! it without a restart.

use crate::config::ServiceConfig;
use crate::embeddings::HashingEmbedder;
use crate::error::Result;
use crate::models::LabeledExemplar;
use crate::psirt_cache::PsirtCache;
use crate::rate_limit::RateLimiter;
use crate::retriever::VectorRetriever;
use crate::store::VulnerabilityStore;
use crate::taxonomy::TaxonomyStore;
use crate::vector_store::SqliteVectorStore;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

pub struct CoreContext {
    pub config: ServiceConfig,
    pub vulnerabilities: Mutex<VulnerabilityStore>,
    pub devices: crate::inventory::DeviceStore,
    pub taxonomy: TaxonomyStore,
    pub retriever: RwLock<VectorRetriever<HashingEmbedder>>,
    pub psirt_cache: PsirtCache,
    pub analyses: crate::analysis_store::AnalysisStore,
    pub rate_limiter: RateLimiter,
    pub http_client: reqwest::Client,
}

impl CoreContext {
    pub fn build(config: ServiceConfig) -> Result<Self> {
        let vulnerabilities = Mutex::new(VulnerabilityStore::open(&config.database_path)?);
        let devices = crate::inventory::DeviceStore::open(&config.database_path)?;
        let taxonomy = TaxonomyStore::load_from_dir(std::path::Path::new(&config.taxonomy_path))?;
        let vector_store = SqliteVectorStore::new(&config.vector_store_path)?;
        let retriever = RwLock::new(VectorRetriever::new(vector_store, HashingEmbedder::new()));
        let psirt_cache = PsirtCache::open(format!("{}.psirt_cache", config.database_path))?;
        let analyses = crate::analysis_store::AnalysisStore::new();
        let rate_limiter = RateLimiter::from_config(&config);
        let http_client = reqwest::Client::builder()
            .timeout(config.lm_timeout.max(Duration::from_secs(5)))
            .build()
            .map_err(|e| crate::error::Error::Internal(format!("failed to build http client: {e}")))?;

        Ok(Self {
            config,
            vulnerabilities,
            devices,
            taxonomy,
            retriever,
            psirt_cache,
            analyses,
            rate_limiter,
            http_client,
        })
    }

    /// Reloads the exemplar corpus into a fresh vector store and swaps the
    /// retriever pointer.
    pub fn rebuild_vector_index(&self, exemplars: &[LabeledExemplar]) -> Result<()> {
        let fresh_store = SqliteVectorStore::new_in_memory()?;
        let fresh_retriever = VectorRetriever::new(fresh_store, HashingEmbedder::new());
        fresh_retriever.load_corpus(exemplars)?;
        *self.retriever.write().expect("retriever lock poisoned") = fresh_retriever;
        Ok(())
    }
}
