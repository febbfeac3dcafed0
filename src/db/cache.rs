// Permanent document-embedding cache table.
//
// Keyed by (model, provider, md5 of the exact embedded text). Concurrent
// inserts for the same key are tolerated: the row is checked before writing,
// and a racing duplicate is indistinguishable from a hit on read.

use arrow_array::{Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use tracing::{debug, trace};

use crate::db::{
  connection::{DbError, KbDb, Result, escape},
  schema::embedding_cache_schema,
};

fn cache_id(model: &str, provider: &str, text_hash: &str) -> String {
  format!("{model}:{provider}:{text_hash}")
}

impl KbDb {
  /// Look up a cached document embedding.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn get_cached_embedding(&self, model: &str, provider: &str, text_hash: &str) -> Result<Option<Vec<f32>>> {
    let table = self.embedding_cache_table().await?;
    let id = cache_id(model, provider, text_hash);

    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("id = '{}'", escape(&id)))
      .execute()
      .await?
      .try_collect()
      .await?;

    if results.is_empty() || results[0].num_rows() == 0 {
      return Ok(None);
    }

    let vector = read_vector(&results[0], 0)?;
    trace!(hash = text_hash, "Document embedding cache hit");
    Ok(Some(vector))
  }

  /// Cache a document embedding; a concurrent insert for the same key wins
  /// silently.
  #[tracing::instrument(level = "trace", skip(self, vector))]
  pub async fn put_cached_embedding(&self, model: &str, provider: &str, text_hash: &str, vector: &[f32]) -> Result<()> {
    let id = cache_id(model, provider, text_hash);
    let table = self.embedding_cache_table().await?;

    let existing = table.count_rows(Some(format!("id = '{}'", escape(&id)))).await?;
    if existing > 0 {
      debug!(hash = text_hash, "Embedding already cached");
      return Ok(());
    }

    let batch = entry_to_batch(&id, model, provider, text_hash, vector, self.vector_dim)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], embedding_cache_schema(self.vector_dim));
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// Cached entries for the given model/provider (stats).
  pub async fn count_cached_embeddings(&self) -> Result<usize> {
    let table = self.embedding_cache_table().await?;
    Ok(table.count_rows(None).await?)
  }
}

fn entry_to_batch(
  id: &str,
  model: &str,
  provider: &str,
  text_hash: &str,
  vector: &[f32],
  vector_dim: usize,
) -> Result<RecordBatch> {
  let id = StringArray::from(vec![id.to_string()]);
  let model_name = StringArray::from(vec![model.to_string()]);
  let provider_name = StringArray::from(vec![provider.to_string()]);
  let hash = StringArray::from(vec![text_hash.to_string()]);
  let created_at = Int64Array::from(vec![chrono::Utc::now().timestamp_millis()]);

  let mut padded = vector.to_vec();
  padded.resize(vector_dim, 0.0);
  let values = Float32Array::from(padded);
  let field = std::sync::Arc::new(arrow_schema::Field::new("item", arrow_schema::DataType::Float32, true));
  let vector_list = FixedSizeListArray::try_new(field, vector_dim as i32, std::sync::Arc::new(values), None)?;

  let batch = RecordBatch::try_new(
    embedding_cache_schema(vector_dim),
    vec![
      std::sync::Arc::new(id),
      std::sync::Arc::new(model_name),
      std::sync::Arc::new(provider_name),
      std::sync::Arc::new(hash),
      std::sync::Arc::new(vector_list),
      std::sync::Arc::new(created_at),
    ],
  )?;

  Ok(batch)
}

/// Read the FixedSizeList vector column from a row.
pub(in crate::db) fn read_vector(batch: &RecordBatch, row: usize) -> Result<Vec<f32>> {
  let list = batch
    .column_by_name("vector")
    .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
    .ok_or_else(|| DbError::NotFound("column vector".into()))?;

  let value = list.value(row);
  let floats = value
    .as_any()
    .downcast_ref::<Float32Array>()
    .ok_or_else(|| DbError::InvalidInput("vector items are not f32".into()))?;

  Ok(floats.iter().map(|v| v.unwrap_or(0.0)).collect())
}
