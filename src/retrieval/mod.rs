//! Hybrid retrieval engine: dense + keyword first stage, configurable
//! second-stage ranking, per-stage timings, and query-record persistence.

pub mod diagnostics;
pub mod metrics;

use std::{collections::HashMap, sync::Arc, time::Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
  config::{Config, RerankMode, RetrievalMethod},
  db::KbDb,
  domain::{
    document::DocumentStatus,
    query::{QueryId, QueryRecord, SearchTimings},
    tenant::TenantId,
  },
  embed_cache::EmbeddingCache,
  keyword::{KeywordFilter, KeywordIndex},
  limits::TenantLimiter,
  provider::RerankBackend,
  service::error::ServiceError,
  vector::{SearchFilter, VectorStore},
};

/// A retrieval request after clamping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalRequest {
  pub query: String,
  #[serde(default)]
  pub method: Option<RetrievalMethod>,
  #[serde(default = "default_top_k")]
  pub top_k: usize,
  #[serde(default)]
  pub score_threshold: f32,
  #[serde(default)]
  pub filter: Option<SearchFilter>,
}

fn default_top_k() -> usize {
  5
}

/// One scored retrieval hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalHit {
  pub chunk_id: String,
  pub text: String,
  pub score: f32,
  pub document_id: String,
  pub document_name: String,
  pub chunk_index: usize,
  pub start_char: usize,
  pub end_char: usize,
  pub metadata: crate::domain::document::ChunkMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalStats {
  pub total_chunks_searched: usize,
  pub chunks_before_rerank: usize,
  pub chunks_after_rerank: usize,
  pub chunks_filtered_by_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResponse {
  pub query: String,
  pub method: RetrievalMethod,
  pub results: Vec<RetrievalHit>,
  pub timing: SearchTimings,
  pub stats: RetrievalStats,
}

/// First-stage candidate with its per-channel scores.
#[derive(Debug, Clone, Default)]
struct Candidate {
  dense: Option<f32>,
  keyword: Option<f32>,
  /// Position in the first-stage aggregation, for `none` mode ordering
  order: usize,
}

pub struct RetrievalEngine {
  db: Arc<KbDb>,
  vector: Arc<VectorStore>,
  keyword: Arc<KeywordIndex>,
  cache: Arc<EmbeddingCache>,
  rerank: Option<Arc<dyn RerankBackend>>,
  limiter: Arc<TenantLimiter>,
  config: Arc<Config>,
}

impl RetrievalEngine {
  pub fn new(
    db: Arc<KbDb>,
    vector: Arc<VectorStore>,
    keyword: Arc<KeywordIndex>,
    cache: Arc<EmbeddingCache>,
    rerank: Option<Arc<dyn RerankBackend>>,
    limiter: Arc<TenantLimiter>,
    config: Arc<Config>,
  ) -> Self {
    Self {
      db,
      vector,
      keyword,
      cache,
      rerank,
      limiter,
      config,
    }
  }

  /// Run one retrieval, recording a query-history row for `source`.
  pub async fn search(
    &self,
    tenant: TenantId,
    request: RetrievalRequest,
    source: &str,
  ) -> Result<RetrievalResponse, ServiceError> {
    if request.query.trim().is_empty() {
      return Err(ServiceError::Internal("query cannot be empty".to_string()));
    }

    self.limiter.check_retrieval(tenant).await?;

    let completed = self.db.count_documents_by_status(tenant, DocumentStatus::Completed).await?;
    if completed == 0 {
      return Err(ServiceError::not_found("knowledge base", tenant.to_string()));
    }

    // Boundary clamps.
    let top_k = request.top_k.clamp(1, 10);
    let score_threshold = request.score_threshold.clamp(0.0, 1.0);
    let method = request.method.unwrap_or(self.config.retrieval.default_method);

    let start = Instant::now();
    let mut timing = SearchTimings::default();

    // Stage 1: query embedding (cached, validated). Keyword-only searches
    // skip embedding entirely.
    let query_vector = if method == RetrievalMethod::Keyword {
      None
    } else {
      let embed_start = Instant::now();
      let vector = self.cache.embed_query(&request.query).await?;
      timing.embedding_ms = embed_start.elapsed().as_secs_f64() * 1000.0;
      Some(vector)
    };

    // Stage 2: dense and keyword searches in parallel at 2x depth.
    let search_start = Instant::now();
    let fetch_k = top_k * 2;
    let candidates = self
      .first_stage(tenant, method, &request, query_vector.as_deref(), fetch_k)
      .await?;
    timing.search_ms = search_start.elapsed().as_secs_f64() * 1000.0;

    debug!(
      method = method.as_str(),
      candidates = candidates.len(),
      "First-stage search complete"
    );

    // Stage 3: one chunk-row lookup for the whole candidate set.
    let ids: Vec<String> = candidates.iter().map(|(id, _)| id.clone()).collect();
    let chunk_rows = self.db.get_chunks_by_ids(&ids).await?;
    let chunks_by_id: HashMap<String, _> = chunk_rows.into_iter().map(|c| (c.id.to_string(), c)).collect();
    let documents: HashMap<String, String> = self
      .db
      .list_documents(tenant)
      .await?
      .into_iter()
      .map(|d| (d.id.to_string(), d.file_name))
      .collect();

    let candidate_map: HashMap<&str, &Candidate> = candidates.iter().map(|(id, c)| (id.as_str(), c)).collect();

    // Stage 4: second-stage ranking.
    let rerank_start = Instant::now();
    let before_rerank = ids.len();
    let mut hits = match self.config.retrieval.reranking_mode {
      RerankMode::RerankingModel if before_rerank > 1 && self.rerank.is_some() => {
        self
          .rerank_with_model(&request.query, &ids, &chunks_by_id, &documents, top_k, score_threshold)
          .await?
      }
      RerankMode::WeightedScore => {
        self.weighted_rank(&ids, &candidate_map, &chunks_by_id, &documents, top_k, score_threshold)
      }
      _ => self.first_stage_order(&ids, &candidate_map, &chunks_by_id, &documents, top_k),
    };
    timing.rerank_ms = rerank_start.elapsed().as_secs_f64() * 1000.0;
    timing.total_ms = start.elapsed().as_secs_f64() * 1000.0;

    hits.truncate(top_k);

    let stats = RetrievalStats {
      total_chunks_searched: before_rerank,
      chunks_before_rerank: before_rerank,
      chunks_after_rerank: hits.len(),
      chunks_filtered_by_threshold: before_rerank.saturating_sub(hits.len()),
    };

    info!(
      query = %truncate(&request.query, 30),
      method = method.as_str(),
      results = hits.len(),
      total_ms = timing.total_ms as u64,
      "Retrieval complete"
    );

    // Query history is best-effort; a failed record never fails the search.
    let record = QueryRecord {
      id: QueryId::new(),
      tenant_id: tenant,
      query: request.query.clone(),
      method,
      top_k,
      score_threshold,
      result_count: hits.len(),
      timings: timing,
      source: source.to_string(),
      created_at: chrono::Utc::now(),
    };
    if let Err(e) = self.db.add_query_record(&record).await {
      warn!(error = %e, "Failed to record query history");
    }

    Ok(RetrievalResponse {
      query: request.query,
      method,
      results: hits,
      timing,
      stats,
    })
  }

  /// First stage: union of dense and keyword candidates with their scores.
  async fn first_stage(
    &self,
    tenant: TenantId,
    method: RetrievalMethod,
    request: &RetrievalRequest,
    query_vector: Option<&[f32]>,
    fetch_k: usize,
  ) -> Result<Vec<(String, Candidate)>, ServiceError> {
    let keyword_filter = request
      .filter
      .as_ref()
      .map(|f| KeywordFilter {
        document_id: f.document_id.clone(),
        document_type: f.document_type.clone(),
        category: f.category.clone(),
      })
      .unwrap_or_default();

    let (dense_hits, keyword_hits) = match method {
      RetrievalMethod::Semantic => {
        let vector = query_vector.unwrap_or_default();
        let dense = self.vector.search(tenant, vector, fetch_k, request.filter.as_ref()).await?;
        (dense, Vec::new())
      }
      RetrievalMethod::Keyword => {
        let sparse = self.keyword.search(tenant, &request.query, fetch_k, &keyword_filter).await?;
        (Vec::new(), sparse)
      }
      RetrievalMethod::Hybrid => {
        let vector = query_vector.unwrap_or_default();
        let (dense, sparse) = tokio::join!(
          self.vector.search(tenant, vector, fetch_k, request.filter.as_ref()),
          self.keyword.search(tenant, &request.query, fetch_k, &keyword_filter),
        );
        (dense?, sparse?)
      }
    };

    // Union keyed by chunk id; dense hits keep their first-stage order.
    let mut ordered: Vec<String> = Vec::new();
    let mut merged: HashMap<String, Candidate> = HashMap::new();

    for (id, score) in dense_hits {
      let entry = merged.entry(id.clone()).or_insert_with(|| {
        ordered.push(id.clone());
        Candidate {
          order: ordered.len() - 1,
          ..Default::default()
        }
      });
      entry.dense = Some(score);
    }
    for (id, score) in keyword_hits {
      let entry = merged.entry(id.clone()).or_insert_with(|| {
        ordered.push(id.clone());
        Candidate {
          order: ordered.len() - 1,
          ..Default::default()
        }
      });
      entry.keyword = Some(score);
    }

    Ok(
      ordered
        .into_iter()
        .map(|id| {
          let candidate = merged.remove(&id).unwrap_or_default();
          (id, candidate)
        })
        .collect(),
    )
  }

  async fn rerank_with_model(
    &self,
    query: &str,
    ids: &[String],
    chunks: &HashMap<String, crate::domain::document::Chunk>,
    documents: &HashMap<String, String>,
    top_k: usize,
    score_threshold: f32,
  ) -> Result<Vec<RetrievalHit>, ServiceError> {
    let rerank = self.rerank.as_ref().ok_or_else(|| ServiceError::internal("no rerank backend"))?;

    let texts: Vec<String> = ids
      .iter()
      .filter_map(|id| chunks.get(id).map(|c| c.text.clone()))
      .collect();

    let reranked = rerank
      .rerank(query, &texts, top_k, Some(score_threshold))
      .await?;

    let mut hits = Vec::with_capacity(reranked.len());
    for item in reranked {
      let Some(id) = ids.get(item.index) else { continue };
      let Some(chunk) = chunks.get(id) else { continue };
      hits.push(self.hit_for(chunk, documents, item.score));
    }
    Ok(hits)
  }

  fn weighted_rank(
    &self,
    ids: &[String],
    candidates: &HashMap<&str, &Candidate>,
    chunks: &HashMap<String, crate::domain::document::Chunk>,
    documents: &HashMap<String, String>,
    top_k: usize,
    score_threshold: f32,
  ) -> Vec<RetrievalHit> {
    let vw = self.config.retrieval.hybrid_vector_weight;
    let kw = self.config.retrieval.hybrid_keyword_weight;

    let mut scored: Vec<(&String, f32)> = ids
      .iter()
      .map(|id| {
        let candidate = candidates.get(id.as_str()).copied();
        let dense = candidate.and_then(|c| c.dense).unwrap_or(0.0);
        let keyword = candidate.and_then(|c| c.keyword).unwrap_or(0.0);
        (id, vw * dense + kw * keyword)
      })
      .filter(|(_, score)| *score > 0.0 && *score >= score_threshold)
      .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);

    scored
      .into_iter()
      .filter_map(|(id, score)| chunks.get(id).map(|c| self.hit_for(c, documents, score)))
      .collect()
  }

  fn first_stage_order(
    &self,
    ids: &[String],
    candidates: &HashMap<&str, &Candidate>,
    chunks: &HashMap<String, crate::domain::document::Chunk>,
    documents: &HashMap<String, String>,
    top_k: usize,
  ) -> Vec<RetrievalHit> {
    let mut ordered: Vec<&String> = ids.iter().collect();
    ordered.sort_by_key(|id| candidates.get(id.as_str()).map(|c| c.order).unwrap_or(usize::MAX));
    ordered.truncate(top_k);

    ordered
      .into_iter()
      .filter_map(|id| {
        let candidate = candidates.get(id.as_str()).copied();
        let score = candidate
          .and_then(|c| c.dense.or(c.keyword))
          .unwrap_or(0.5);
        chunks.get(id).map(|c| self.hit_for(c, documents, score))
      })
      .collect()
  }

  fn hit_for(
    &self,
    chunk: &crate::domain::document::Chunk,
    documents: &HashMap<String, String>,
    score: f32,
  ) -> RetrievalHit {
    let document_id = chunk.document_id.to_string();
    RetrievalHit {
      chunk_id: chunk.id.to_string(),
      text: chunk.text.clone(),
      score,
      document_name: documents.get(&document_id).cloned().unwrap_or_else(|| "Unknown".to_string()),
      document_id,
      chunk_index: chunk.chunk_index,
      start_char: chunk.start_char,
      end_char: chunk.end_char,
      metadata: chunk.metadata.clone(),
    }
  }

  /// Run a labelled evaluation dataset with the given method, averaging the
  /// quality metrics over its queries.
  pub async fn evaluate(
    &self,
    tenant: TenantId,
    dataset_id: &str,
    method: RetrievalMethod,
  ) -> Result<EvaluationReport, ServiceError> {
    let Some(dataset) = self.db.get_evaluation_dataset(tenant, dataset_id).await? else {
      return Err(ServiceError::not_found("evaluation dataset", dataset_id));
    };
    if dataset.queries.is_empty() {
      return Err(ServiceError::Internal("dataset has no queries".to_string()));
    }

    let mut query_results = Vec::new();
    let mut all_metrics = Vec::new();

    for labelled in &dataset.queries {
      if labelled.query.is_empty() {
        continue;
      }

      let expected: Vec<String> = labelled.expected_chunk_ids.iter().map(|id| id.to_string()).collect();
      let fetch_k = (expected.len().max(1)) * 2;

      let query_vector = if method == RetrievalMethod::Keyword {
        None
      } else {
        Some(self.cache.embed_query(&labelled.query).await?)
      };
      let request = RetrievalRequest {
        query: labelled.query.clone(),
        method: Some(method),
        top_k: fetch_k.clamp(1, 10),
        score_threshold: 0.0,
        filter: None,
      };
      let retrieved: Vec<String> = match self
        .first_stage(tenant, method, &request, query_vector.as_deref(), fetch_k)
        .await
      {
        Ok(candidates) => candidates.into_iter().map(|(id, _)| id).collect(),
        Err(e) => {
          warn!(query = %labelled.query, error = %e, "Evaluation query failed");
          continue;
        }
      };

      let relevance = if labelled.relevance_scores.is_empty() {
        None
      } else {
        Some(labelled.relevance_scores.clone())
      };
      let m = metrics::quality_metrics(&retrieved, &expected, relevance.as_ref());
      all_metrics.push(m);
      query_results.push(EvaluationQueryResult {
        query: labelled.query.clone(),
        metrics: m,
      });
    }

    Ok(EvaluationReport {
      dataset_id: dataset_id.to_string(),
      method,
      total_queries: dataset.queries.len(),
      evaluated_queries: query_results.len(),
      average_metrics: metrics::average(&all_metrics),
      query_results,
    })
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationQueryResult {
  pub query: String,
  pub metrics: metrics::QualityMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
  pub dataset_id: String,
  pub method: RetrievalMethod,
  pub total_queries: usize,
  pub evaluated_queries: usize,
  pub average_metrics: metrics::QualityMetrics,
  pub query_results: Vec<EvaluationQueryResult>,
}

fn truncate(s: &str, max: usize) -> String {
  if s.chars().count() <= max {
    s.to_string()
  } else {
    s.chars().take(max).collect::<String>() + "…"
  }
}
