// Knowledge spaces: one row per tenant, created on first use.

use arrow_array::{Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt64Array};
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};

use crate::{
  db::{
    connection::{DbError, KbDb, Result},
    schema::spaces_schema,
  },
  domain::tenant::{KnowledgeSpace, TenantId},
};

impl KbDb {
  pub async fn spaces_table(&self) -> Result<lancedb::Table> {
    Ok(self.connection.open_table("knowledge_spaces").execute().await?)
  }

  /// Get the tenant's space, creating it on first use. At most one space
  /// exists per tenant.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn get_or_create_space(&self, tenant: TenantId) -> Result<KnowledgeSpace> {
    if let Some(space) = self.get_space(tenant).await? {
      return Ok(space);
    }

    let space = KnowledgeSpace::new(tenant);
    self.put_space(&space).await?;
    Ok(space)
  }

  pub async fn get_space(&self, tenant: TenantId) -> Result<Option<KnowledgeSpace>> {
    let table = self.spaces_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("tenant_id = {}", tenant.as_u64()))
      .execute()
      .await?
      .try_collect()
      .await?;

    if results.is_empty() || results[0].num_rows() == 0 {
      return Ok(None);
    }
    Ok(Some(batch_to_space(&results[0], 0)?))
  }

  /// Insert or replace the tenant's space row.
  pub async fn put_space(&self, space: &KnowledgeSpace) -> Result<()> {
    let table = self.spaces_table().await?;
    table
      .delete(&format!("tenant_id = {}", space.tenant_id.as_u64()))
      .await
      .ok();

    let rules = space
      .processing_rules
      .as_ref()
      .map(serde_json::to_string)
      .transpose()?;

    let batch = RecordBatch::try_new(
      spaces_schema(),
      vec![
        std::sync::Arc::new(UInt64Array::from(vec![space.tenant_id.as_u64()])),
        std::sync::Arc::new(StringArray::from(vec![rules])),
        std::sync::Arc::new(Int64Array::from(vec![space.created_at.timestamp_millis()])),
      ],
    )?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], spaces_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }
}

fn batch_to_space(batch: &RecordBatch, row: usize) -> Result<KnowledgeSpace> {
  let tenant_id = batch
    .column_by_name("tenant_id")
    .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column tenant_id".into()))?;

  let rules_col = batch
    .column_by_name("processing_rules")
    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    .ok_or_else(|| DbError::NotFound("column processing_rules".into()))?;
  let processing_rules = if rules_col.is_null(row) {
    None
  } else {
    Some(serde_json::from_str(rules_col.value(row))?)
  };

  let created_ms = batch
    .column_by_name("created_at")
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column created_at".into()))?;

  Ok(KnowledgeSpace {
    tenant_id: TenantId(tenant_id),
    processing_rules,
    created_at: Utc
      .timestamp_millis_opt(created_ms)
      .single()
      .ok_or_else(|| DbError::InvalidInput("invalid created_at timestamp".into()))?,
  })
}
