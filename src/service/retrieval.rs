//! Retrieval-facing service operations: the retrieval test, history,
//! feedback, evaluation, and observability endpoints.

use std::time::Duration;

use super::{Services, error::ServiceError};
use crate::{
  config::RetrievalMethod,
  domain::{
    query::{Feedback, FeedbackKind, QueryRecord},
    tenant::TenantId,
  },
  provider::{ChatMessage, ModelAlias},
  retrieval::{EvaluationReport, RetrievalRequest, RetrievalResponse, diagnostics},
  vector::CompressionMetrics,
};

impl Services {
  /// Run the retrieval test under the per-request timeout.
  pub async fn retrieval_test(
    &self,
    tenant: TenantId,
    query: String,
    method: Option<RetrievalMethod>,
    top_k: Option<usize>,
    score_threshold: Option<f32>,
  ) -> Result<RetrievalResponse, ServiceError> {
    let request = RetrievalRequest {
      query,
      method,
      top_k: top_k.unwrap_or(5),
      score_threshold: score_threshold.unwrap_or(0.0),
      filter: None,
    };

    let timeout = Duration::from_secs(self.config.retrieval.request_timeout_secs);
    match tokio::time::timeout(timeout, self.retrieval.search(tenant, request, "retrieval_test")).await {
      Ok(result) => result,
      Err(_) => Err(ServiceError::ProviderTransient(format!(
        "retrieval timed out after {}s",
        timeout.as_secs()
      ))),
    }
  }

  /// The retained retrieval-test history (at most 10 records).
  pub async fn retrieval_history(&self, tenant: TenantId) -> Result<Vec<QueryRecord>, ServiceError> {
    Ok(self.db.list_query_records(tenant, "retrieval_test").await?)
  }

  pub async fn submit_feedback(
    &self,
    tenant: TenantId,
    query_id: &str,
    kind: &str,
    score: Option<u8>,
    relevant_chunk_ids: Vec<String>,
    irrelevant_chunk_ids: Vec<String>,
  ) -> Result<(), ServiceError> {
    if let Some(score) = score
      && !(1..=5).contains(&score)
    {
      return Err(ServiceError::internal(format!("feedback score {score} outside 1..=5")));
    }

    let feedback = Feedback {
      query_id: query_id
        .parse()
        .map_err(|_| ServiceError::not_found("query", query_id))?,
      tenant_id: tenant,
      kind: kind
        .parse::<FeedbackKind>()
        .map_err(ServiceError::Internal)?,
      score,
      relevant_chunk_ids: relevant_chunk_ids
        .iter()
        .filter_map(|id| id.parse().ok())
        .collect(),
      irrelevant_chunk_ids: irrelevant_chunk_ids
        .iter()
        .filter_map(|id| id.parse().ok())
        .collect(),
      created_at: chrono::Utc::now(),
    };

    Ok(self.db.add_feedback(&feedback).await?)
  }

  pub async fn create_evaluation_dataset(
    &self,
    tenant: TenantId,
    name: String,
    queries: serde_json::Value,
  ) -> Result<String, ServiceError> {
    let queries = serde_json::from_value(queries).map_err(|e| ServiceError::internal(format!("invalid queries: {e}")))?;
    let dataset = crate::domain::query::EvaluationDataset {
      id: uuid::Uuid::new_v4(),
      tenant_id: tenant,
      name,
      queries,
      created_at: chrono::Utc::now(),
    };
    self.db.add_evaluation_dataset(&dataset).await?;
    Ok(dataset.id.to_string())
  }

  pub async fn list_evaluation_datasets(&self, tenant: TenantId) -> Result<Vec<serde_json::Value>, ServiceError> {
    let datasets = self.db.list_evaluation_datasets(tenant).await?;
    Ok(
      datasets
        .into_iter()
        .map(|d| {
          serde_json::json!({
            "id": d.id.to_string(),
            "name": d.name,
            "query_count": d.queries.len(),
            "created_at": d.created_at.to_rfc3339(),
          })
        })
        .collect(),
    )
  }

  pub async fn run_evaluation(
    &self,
    tenant: TenantId,
    dataset_id: &str,
    method: Option<RetrievalMethod>,
  ) -> Result<EvaluationReport, ServiceError> {
    let method = method.unwrap_or(self.config.retrieval.default_method);
    self.retrieval.evaluate(tenant, dataset_id, method).await
  }

  pub async fn compression_metrics(&self, tenant: TenantId) -> Result<CompressionMetrics, ServiceError> {
    Ok(self.vector.compression_metrics(tenant).await?)
  }

  /// Diagram generation: one non-streaming chat completion against the
  /// requested alias (default qwen).
  pub async fn generate_graph(
    &self,
    prompt: String,
    model_alias: Option<String>,
  ) -> Result<crate::ipc::types::GeneratedContent, ServiceError> {
    let alias: ModelAlias = match model_alias.as_deref() {
      Some(raw) => raw.parse().map_err(ServiceError::Internal)?,
      None => ModelAlias::Qwen,
    };

    let result = self.chat.chat(alias, vec![ChatMessage::user(prompt)]).await?;
    Ok(crate::ipc::types::GeneratedContent {
      content: result.value,
      model_alias: alias.as_str().to_string(),
      input_tokens: result.usage.input_tokens,
      output_tokens: result.usage.output_tokens,
      total_tokens: result.usage.total_tokens,
      elapsed_ms: result.elapsed.as_secs_f64() * 1000.0,
    })
  }

  pub async fn vector_diagnostics(&self, tenant: TenantId) -> Result<serde_json::Value, ServiceError> {
    let report = diagnostics::drift_report(&self.db, &self.vector, tenant).await?;
    serde_json::to_value(&report).map_err(|e| ServiceError::internal(e.to_string()))
  }
}
