// Batch upload tracking.

use arrow_array::{Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array, UInt64Array};
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};

use crate::{
  db::{
    connection::{DbError, KbDb, Result, escape},
    schema::batches_schema,
  },
  domain::{
    document::{Batch, BatchStatus},
    tenant::TenantId,
  },
};

impl KbDb {
  /// Insert or replace a batch row.
  #[tracing::instrument(level = "trace", skip(self, batch), fields(id = %batch.id))]
  pub async fn upsert_batch(&self, batch: &Batch) -> Result<()> {
    let table = self.batches_table().await?;
    table.delete(&format!("id = '{}'", batch.id)).await.ok();

    let record = batch_to_record(batch)?;
    let batches = RecordBatchIterator::new(vec![Ok(record)], batches_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// Get a batch, scoped to its owning tenant.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn get_batch(&self, tenant: TenantId, id: &str) -> Result<Option<Batch>> {
    let table = self.batches_table().await?;
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
    Ok(Some(record_to_batch(&results[0], 0)?))
  }
}

fn batch_to_record(batch: &Batch) -> Result<RecordBatch> {
  let id = StringArray::from(vec![batch.id.to_string()]);
  let tenant_id = UInt64Array::from(vec![batch.tenant_id.as_u64()]);
  let total = UInt32Array::from(vec![batch.total as u32]);
  let completed = UInt32Array::from(vec![batch.completed as u32]);
  let failed = UInt32Array::from(vec![batch.failed as u32]);
  let status = StringArray::from(vec![batch.status.as_str().to_string()]);
  let created_at = Int64Array::from(vec![batch.created_at.timestamp_millis()]);

  let record = RecordBatch::try_new(
    batches_schema(),
    vec![
      std::sync::Arc::new(id),
      std::sync::Arc::new(tenant_id),
      std::sync::Arc::new(total),
      std::sync::Arc::new(completed),
      std::sync::Arc::new(failed),
      std::sync::Arc::new(status),
      std::sync::Arc::new(created_at),
    ],
  )?;

  Ok(record)
}

fn record_to_batch(record: &RecordBatch, row: usize) -> Result<Batch> {
  let get_string = |name: &str| -> Result<String> {
    record
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .map(|a| a.value(row).to_string())
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
  };

  let get_u32 = |name: &str| -> Result<u32> {
    record
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
      .map(|a| a.value(row))
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
  };

  let tenant_id = record
    .column_by_name("tenant_id")
    .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column tenant_id".into()))?;

  let created_ms = record
    .column_by_name("created_at")
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column created_at".into()))?;

  Ok(Batch {
    id: get_string("id")?
      .parse()
      .map_err(|_| DbError::InvalidInput("invalid batch id".into()))?,
    tenant_id: TenantId(tenant_id),
    total: get_u32("total")? as usize,
    completed: get_u32("completed")? as usize,
    failed: get_u32("failed")? as usize,
    status: get_string("status")?
      .parse::<BatchStatus>()
      .map_err(DbError::InvalidInput)?,
    created_at: Utc
      .timestamp_millis_opt(created_ms)
      .single()
      .ok_or_else(|| DbError::InvalidInput("invalid created_at timestamp".into()))?,
  })
}
