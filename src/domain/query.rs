use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{document::ChunkId, tenant::TenantId};
use crate::config::RetrievalMethod;

/// Unique identifier for a recorded query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(Uuid);

impl QueryId {
  pub fn new() -> Self {
    Self(Uuid::now_v7())
  }
}

impl Default for QueryId {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Display for QueryId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl std::str::FromStr for QueryId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(Self(Uuid::parse_str(s)?))
  }
}

/// Per-stage wall times for one retrieval, in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SearchTimings {
  pub embedding_ms: f64,
  pub search_ms: f64,
  pub rerank_ms: f64,
  pub total_ms: f64,
}

/// A recorded retrieval query. For the `retrieval_test` source only the 10
/// most recent records per space are retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
  pub id: QueryId,
  pub tenant_id: TenantId,
  pub query: String,
  pub method: RetrievalMethod,
  pub top_k: usize,
  pub score_threshold: f32,
  pub result_count: usize,
  pub timings: SearchTimings,
  /// Where the query came from, e.g. "retrieval_test"
  pub source: String,
  pub created_at: DateTime<Utc>,
}

/// User sentiment on one query's results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
  Positive,
  Negative,
  Neutral,
}

impl FeedbackKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Positive => "positive",
      Self::Negative => "negative",
      Self::Neutral => "neutral",
    }
  }
}

impl std::str::FromStr for FeedbackKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "positive" => Ok(Self::Positive),
      "negative" => Ok(Self::Negative),
      "neutral" => Ok(Self::Neutral),
      other => Err(format!("unknown feedback kind: {other}")),
    }
  }
}

/// Per-query feedback used by quality evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
  pub query_id: QueryId,
  pub tenant_id: TenantId,
  pub kind: FeedbackKind,
  /// Optional 1..=5 rating
  #[serde(skip_serializing_if = "Option::is_none")]
  pub score: Option<u8>,
  pub relevant_chunk_ids: Vec<ChunkId>,
  pub irrelevant_chunk_ids: Vec<ChunkId>,
  pub created_at: DateTime<Utc>,
}

/// One labelled query in an evaluation dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationQuery {
  pub query: String,
  pub expected_chunk_ids: Vec<ChunkId>,
  /// Optional graded relevance; binary relevance is assumed when absent
  #[serde(default)]
  pub relevance_scores: std::collections::HashMap<String, f64>,
}

/// A named set of labelled queries for offline quality evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationDataset {
  pub id: Uuid,
  pub tenant_id: TenantId,
  pub name: String,
  pub queries: Vec<EvaluationQuery>,
  pub created_at: DateTime<Utc>,
}
