// Query records, feedback and evaluation datasets.

use arrow_array::{
  Array, Float32Array, Float64Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array,
  UInt64Array,
};
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use tracing::debug;
use uuid::Uuid;

use crate::{
  db::{
    connection::{DbError, KbDb, Result, escape},
    schema::{evaluation_datasets_schema, feedback_schema, query_records_schema},
  },
  domain::{
    query::{EvaluationDataset, Feedback, QueryRecord, SearchTimings},
    tenant::TenantId,
  },
};

/// How many `retrieval_test` query records are retained per space.
pub const RETRIEVAL_TEST_HISTORY: usize = 10;

impl KbDb {
  /// Record a retrieval query. For the `retrieval_test` source, only the
  /// [`RETRIEVAL_TEST_HISTORY`] most recent records per space survive.
  #[tracing::instrument(level = "trace", skip(self, record), fields(id = %record.id))]
  pub async fn add_query_record(&self, record: &QueryRecord) -> Result<()> {
    let table = self.query_records_table().await?;
    let batch = query_to_batch(record)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], query_records_schema());
    table.add(Box::new(batches)).execute().await?;

    if record.source == "retrieval_test" {
      self.prune_retrieval_test_history(record.tenant_id).await?;
    }
    Ok(())
  }

  async fn prune_retrieval_test_history(&self, tenant: TenantId) -> Result<()> {
    let mut records = self.list_query_records(tenant, "retrieval_test").await?;
    if records.len() <= RETRIEVAL_TEST_HISTORY {
      return Ok(());
    }

    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let stale: Vec<String> = records[RETRIEVAL_TEST_HISTORY..]
      .iter()
      .map(|r| format!("'{}'", r.id))
      .collect();

    debug!(tenant = %tenant, pruned = stale.len(), "Pruning retrieval test history");
    let table = self.query_records_table().await?;
    table.delete(&format!("id IN ({})", stale.join(", "))).await?;
    Ok(())
  }

  /// A tenant's query records from one source, newest first.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn list_query_records(&self, tenant: TenantId, source: &str) -> Result<Vec<QueryRecord>> {
    let table = self.query_records_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!(
        "tenant_id = {} AND source = '{}'",
        tenant.as_u64(),
        escape(source)
      ))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut records = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        records.push(batch_to_query(&batch, row)?);
      }
    }
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(records)
  }

  /// Store user feedback for a query.
  #[tracing::instrument(level = "trace", skip(self, feedback), fields(query_id = %feedback.query_id))]
  pub async fn add_feedback(&self, feedback: &Feedback) -> Result<()> {
    let table = self.feedback_table().await?;
    let batch = feedback_to_batch(feedback)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], feedback_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// Create an evaluation dataset.
  #[tracing::instrument(level = "trace", skip(self, dataset), fields(id = %dataset.id))]
  pub async fn add_evaluation_dataset(&self, dataset: &EvaluationDataset) -> Result<()> {
    let table = self.evaluation_datasets_table().await?;
    let batch = dataset_to_batch(dataset)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], evaluation_datasets_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// Fetch an evaluation dataset, tenant-scoped.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn get_evaluation_dataset(&self, tenant: TenantId, id: &str) -> Result<Option<EvaluationDataset>> {
    let table = self.evaluation_datasets_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("id = '{}' AND tenant_id = {}", escape(id), tenant.as_u64()))
      .execute()
      .await?
      .try_collect()
      .await?;

    if results.is_empty() || results[0].num_rows() == 0 {
      return Ok(None);
    }
    Ok(Some(batch_to_dataset(&results[0], 0)?))
  }

  /// List a tenant's evaluation datasets.
  pub async fn list_evaluation_datasets(&self, tenant: TenantId) -> Result<Vec<EvaluationDataset>> {
    let table = self.evaluation_datasets_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("tenant_id = {}", tenant.as_u64()))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut datasets = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        datasets.push(batch_to_dataset(&batch, row)?);
      }
    }
    Ok(datasets)
  }
}

fn query_to_batch(record: &QueryRecord) -> Result<RecordBatch> {
  let batch = RecordBatch::try_new(
    query_records_schema(),
    vec![
      std::sync::Arc::new(StringArray::from(vec![record.id.to_string()])),
      std::sync::Arc::new(UInt64Array::from(vec![record.tenant_id.as_u64()])),
      std::sync::Arc::new(StringArray::from(vec![record.query.clone()])),
      std::sync::Arc::new(StringArray::from(vec![record.method.as_str().to_string()])),
      std::sync::Arc::new(UInt32Array::from(vec![record.top_k as u32])),
      std::sync::Arc::new(Float32Array::from(vec![record.score_threshold])),
      std::sync::Arc::new(UInt32Array::from(vec![record.result_count as u32])),
      std::sync::Arc::new(Float64Array::from(vec![record.timings.embedding_ms])),
      std::sync::Arc::new(Float64Array::from(vec![record.timings.search_ms])),
      std::sync::Arc::new(Float64Array::from(vec![record.timings.rerank_ms])),
      std::sync::Arc::new(Float64Array::from(vec![record.timings.total_ms])),
      std::sync::Arc::new(StringArray::from(vec![record.source.clone()])),
      std::sync::Arc::new(Int64Array::from(vec![record.created_at.timestamp_millis()])),
    ],
  )?;
  Ok(batch)
}

fn batch_to_query(batch: &RecordBatch, row: usize) -> Result<QueryRecord> {
  let get_string = |name: &str| -> Result<String> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .map(|a| a.value(row).to_string())
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
  };

  let get_u32 = |name: &str| -> Result<u32> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
      .map(|a| a.value(row))
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
  };

  let get_f64 = |name: &str| -> Result<f64> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
      .map(|a| a.value(row))
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
  };

  let tenant_id = batch
    .column_by_name("tenant_id")
    .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column tenant_id".into()))?;

  let score_threshold = batch
    .column_by_name("score_threshold")
    .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column score_threshold".into()))?;

  let created_ms = batch
    .column_by_name("created_at")
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column created_at".into()))?;

  Ok(QueryRecord {
    id: get_string("id")?
      .parse()
      .map_err(|_| DbError::InvalidInput("invalid query id".into()))?,
    tenant_id: TenantId(tenant_id),
    query: get_string("query")?,
    method: get_string("method")?.parse().map_err(DbError::InvalidInput)?,
    top_k: get_u32("top_k")? as usize,
    score_threshold,
    result_count: get_u32("result_count")? as usize,
    timings: SearchTimings {
      embedding_ms: get_f64("embedding_ms")?,
      search_ms: get_f64("search_ms")?,
      rerank_ms: get_f64("rerank_ms")?,
      total_ms: get_f64("total_ms")?,
    },
    source: get_string("source")?,
    created_at: Utc
      .timestamp_millis_opt(created_ms)
      .single()
      .ok_or_else(|| DbError::InvalidInput("invalid created_at timestamp".into()))?,
  })
}

fn feedback_to_batch(feedback: &Feedback) -> Result<RecordBatch> {
  let relevant = serde_json::to_string(&feedback.relevant_chunk_ids)?;
  let irrelevant = serde_json::to_string(&feedback.irrelevant_chunk_ids)?;

  let batch = RecordBatch::try_new(
    feedback_schema(),
    vec![
      std::sync::Arc::new(StringArray::from(vec![Uuid::new_v4().to_string()])),
      std::sync::Arc::new(StringArray::from(vec![feedback.query_id.to_string()])),
      std::sync::Arc::new(UInt64Array::from(vec![feedback.tenant_id.as_u64()])),
      std::sync::Arc::new(StringArray::from(vec![feedback.kind.as_str().to_string()])),
      std::sync::Arc::new(UInt32Array::from(vec![feedback.score.map(|s| s as u32)])),
      std::sync::Arc::new(StringArray::from(vec![relevant])),
      std::sync::Arc::new(StringArray::from(vec![irrelevant])),
      std::sync::Arc::new(Int64Array::from(vec![feedback.created_at.timestamp_millis()])),
    ],
  )?;
  Ok(batch)
}

fn dataset_to_batch(dataset: &EvaluationDataset) -> Result<RecordBatch> {
  let batch = RecordBatch::try_new(
    evaluation_datasets_schema(),
    vec![
      std::sync::Arc::new(StringArray::from(vec![dataset.id.to_string()])),
      std::sync::Arc::new(UInt64Array::from(vec![dataset.tenant_id.as_u64()])),
      std::sync::Arc::new(StringArray::from(vec![dataset.name.clone()])),
      std::sync::Arc::new(StringArray::from(vec![serde_json::to_string(&dataset.queries)?])),
      std::sync::Arc::new(Int64Array::from(vec![dataset.created_at.timestamp_millis()])),
    ],
  )?;
  Ok(batch)
}

fn batch_to_dataset(batch: &RecordBatch, row: usize) -> Result<EvaluationDataset> {
  let get_string = |name: &str| -> Result<String> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .map(|a| a.value(row).to_string())
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
  };

  let tenant_id = batch
    .column_by_name("tenant_id")
    .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column tenant_id".into()))?;

  let created_ms = batch
    .column_by_name("created_at")
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column created_at".into()))?;

  Ok(EvaluationDataset {
    id: Uuid::parse_str(&get_string("id")?).map_err(|_| DbError::InvalidInput("invalid dataset id".into()))?,
    tenant_id: TenantId(tenant_id),
    name: get_string("name")?,
    queries: serde_json::from_str(&get_string("queries")?)?,
    created_at: Utc
      .timestamp_millis_opt(created_ms)
      .single()
      .ok_or_else(|| DbError::InvalidInput("invalid created_at timestamp".into()))?,
  })
}
