//! Two-tier embedding cache.
//!
//! Document embeddings are cached permanently in the database, keyed by
//! `(model, provider, md5(text))`. Query embeddings live in an in-memory
//! cache whose 600 s TTL refreshes on every read. Both tiers validate
//! vectors on the way out: NaN/Inf/zero-norm entries are misses and get
//! regenerated, so callers only ever see L2-normalized vectors.

use std::{sync::Arc, time::Duration};

use moka::future::Cache;
use tracing::{debug, warn};

use crate::{
  config::EmbeddingConfig,
  db::KbDb,
  provider::{EmbeddingBackend, ProviderError, validation},
};

/// md5 hex digest of the exact text fed to the embedder.
pub fn text_hash(text: &str) -> String {
  format!("{:x}", md5::compute(text.as_bytes()))
}

pub struct EmbeddingCache {
  db: Arc<KbDb>,
  backend: Arc<dyn EmbeddingBackend>,
  query_cache: Cache<String, Vec<f32>>,
}

impl EmbeddingCache {
  pub fn new(db: Arc<KbDb>, backend: Arc<dyn EmbeddingBackend>, config: &EmbeddingConfig) -> Self {
    // time_to_idle refreshes the entry's TTL on every read.
    let query_cache = Cache::builder()
      .max_capacity(10_000)
      .time_to_idle(Duration::from_secs(config.query_cache_ttl_secs))
      .build();

    Self {
      db,
      backend,
      query_cache,
    }
  }

  pub fn backend(&self) -> Arc<dyn EmbeddingBackend> {
    Arc::clone(&self.backend)
  }

  fn query_key(&self, query: &str) -> String {
    format!(
      "query_embedding:{}:{}:{}:{}",
      self.backend.provider_name(),
      self.backend.model_id(),
      self.backend.dimensions(),
      text_hash(query)
    )
  }

  /// Permanent-cache lookup for a document chunk's text.
  pub async fn get_document_embedding(&self, text: &str) -> Option<Vec<f32>> {
    let hash = text_hash(text);
    let cached = self
      .db
      .get_cached_embedding(self.backend.model_id(), self.backend.provider_name(), &hash)
      .await
      .ok()
      .flatten()?;

    match validation::validated_normalized(cached) {
      Some(vector) => Some(vector),
      None => {
        warn!(hash = %hash, "Cached document embedding invalid, treating as miss");
        None
      }
    }
  }

  /// Store a document embedding in the permanent cache. Failures are logged
  /// and swallowed; the cache is an optimization, not a dependency.
  pub async fn cache_document_embedding(&self, text: &str, vector: &[f32]) {
    let hash = text_hash(text);
    if let Err(e) = self
      .db
      .put_cached_embedding(self.backend.model_id(), self.backend.provider_name(), &hash, vector)
      .await
    {
      warn!(hash = %hash, error = %e, "Failed to cache document embedding");
    }
  }

  /// Embed a query with caching. Cache hits refresh their TTL; invalid
  /// cached vectors are regenerated.
  pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>, ProviderError> {
    let key = self.query_key(query);

    if let Some(cached) = self.query_cache.get(&key).await {
      if let Some(vector) = validation::validated_normalized(cached) {
        debug!("Query embedding cache hit");
        return Ok(vector);
      }
      warn!("Cached query embedding invalid, regenerating");
      self.query_cache.invalidate(&key).await;
    }

    let mut vectors = self.backend.embed_batch(&[query.to_string()]).await?;
    let vector = vectors
      .pop()
      .ok_or_else(|| ProviderError::embed_invalid_vector(self.backend.provider_name()))?;

    // Backend output is already validated and normalized; re-check anyway
    // before the vector enters the cache.
    let vector = validation::validated_normalized(vector)
      .ok_or_else(|| ProviderError::embed_invalid_vector(self.backend.provider_name()))?;

    self.query_cache.insert(key, vector.clone()).await;
    Ok(vector)
  }
}
