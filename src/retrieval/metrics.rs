//! Retrieval quality metrics: precision, recall, MRR and NDCG@k.
//!
//! When graded relevance scores are absent, NDCG assumes binary relevance
//! (1.0 for every expected chunk).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
  pub precision: f64,
  pub recall: f64,
  pub mrr: f64,
  pub ndcg: f64,
}

/// Fraction of retrieved chunks that are relevant.
pub fn precision(retrieved: &[String], relevant: &[String]) -> f64 {
  if retrieved.is_empty() {
    return 0.0;
  }
  let hits = retrieved.iter().filter(|id| relevant.contains(id)).count();
  hits as f64 / retrieved.len() as f64
}

/// Fraction of relevant chunks that were retrieved.
pub fn recall(retrieved: &[String], relevant: &[String]) -> f64 {
  if relevant.is_empty() {
    return 0.0;
  }
  let hits = relevant.iter().filter(|id| retrieved.contains(id)).count();
  hits as f64 / relevant.len() as f64
}

/// Reciprocal rank of the first relevant result.
pub fn mrr(retrieved: &[String], relevant: &[String]) -> f64 {
  for (rank, id) in retrieved.iter().enumerate() {
    if relevant.contains(id) {
      return 1.0 / (rank + 1) as f64;
    }
  }
  0.0
}

/// Normalized discounted cumulative gain at `k` (all retrieved when `None`).
pub fn ndcg(retrieved: &[String], relevance: &HashMap<String, f64>, k: Option<usize>) -> f64 {
  if retrieved.is_empty() {
    return 0.0;
  }
  let k = k.unwrap_or(retrieved.len());
  let retrieved = &retrieved[..retrieved.len().min(k)];

  let dcg: f64 = retrieved
    .iter()
    .enumerate()
    .map(|(i, id)| relevance.get(id).copied().unwrap_or(0.0) / ((i + 2) as f64).log2())
    .sum();

  let mut ideal: Vec<f64> = relevance.values().copied().collect();
  ideal.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
  let idcg: f64 = ideal
    .iter()
    .take(k)
    .enumerate()
    .map(|(i, score)| score / ((i + 2) as f64).log2())
    .sum();

  if idcg == 0.0 { 0.0 } else { dcg / idcg }
}

/// All four metrics for one query. Binary relevance stands in for NDCG when
/// no graded scores are supplied.
pub fn quality_metrics(
  retrieved: &[String],
  expected: &[String],
  relevance: Option<&HashMap<String, f64>>,
) -> QualityMetrics {
  let binary: HashMap<String, f64>;
  let scores = match relevance {
    Some(scores) if !scores.is_empty() => scores,
    _ => {
      binary = expected.iter().map(|id| (id.clone(), 1.0)).collect();
      &binary
    }
  };

  QualityMetrics {
    precision: precision(retrieved, expected),
    recall: recall(retrieved, expected),
    mrr: mrr(retrieved, expected),
    ndcg: ndcg(retrieved, scores, None),
  }
}

/// Average metrics across a dataset's queries.
pub fn average(metrics: &[QualityMetrics]) -> QualityMetrics {
  if metrics.is_empty() {
    return QualityMetrics::default();
  }
  let n = metrics.len() as f64;
  QualityMetrics {
    precision: metrics.iter().map(|m| m.precision).sum::<f64>() / n,
    recall: metrics.iter().map(|m| m.recall).sum::<f64>() / n,
    mrr: metrics.iter().map(|m| m.mrr).sum::<f64>() / n,
    ndcg: metrics.iter().map(|m| m.ndcg).sum::<f64>() / n,
  }
}
