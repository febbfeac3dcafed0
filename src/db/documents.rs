// Documents table operations.
//
// Documents are mutated only by the ingestion orchestrator; writes go through
// a delete-then-add upsert keyed by id.

use arrow_array::{Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array, UInt64Array};
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use tracing::debug;

use crate::{
  db::{
    connection::{DbError, KbDb, Result, escape},
    schema::documents_schema,
  },
  domain::{
    document::{Document, DocumentStatus},
    tenant::TenantId,
  },
};

impl KbDb {
  /// Insert or replace a document row.
  #[tracing::instrument(level = "trace", skip(self, doc), fields(id = %doc.id))]
  pub async fn upsert_document(&self, doc: &Document) -> Result<()> {
    let table = self.documents_table().await?;
    table.delete(&format!("id = '{}'", doc.id)).await.ok();

    let batch = document_to_batch(doc)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], documents_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// Get a document by id, scoped to its owning tenant.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn get_document(&self, tenant: TenantId, id: &str) -> Result<Option<Document>> {
    let table = self.documents_table().await?;
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
    Ok(Some(batch_to_document(&results[0], 0)?))
  }

  /// Look up a document by filename within a tenant's space.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn get_document_by_name(&self, tenant: TenantId, file_name: &str) -> Result<Option<Document>> {
    let table = self.documents_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!(
        "tenant_id = {} AND file_name = '{}'",
        tenant.as_u64(),
        escape(file_name)
      ))
      .execute()
      .await?
      .try_collect()
      .await?;

    if results.is_empty() || results[0].num_rows() == 0 {
      return Ok(None);
    }
    Ok(Some(batch_to_document(&results[0], 0)?))
  }

  /// List a tenant's documents, newest first.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn list_documents(&self, tenant: TenantId) -> Result<Vec<Document>> {
    let table = self.documents_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("tenant_id = {}", tenant.as_u64()))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut documents = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        documents.push(batch_to_document(&batch, row)?);
      }
    }
    documents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(documents)
  }

  /// Documents belonging to a batch.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn list_documents_in_batch(&self, batch_id: &str) -> Result<Vec<Document>> {
    let table = self.documents_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("batch_id = '{}'", escape(batch_id)))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut documents = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        documents.push(batch_to_document(&batch, row)?);
      }
    }
    Ok(documents)
  }

  /// Number of documents in a tenant's space (admission check).
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn count_documents(&self, tenant: TenantId) -> Result<usize> {
    let table = self.documents_table().await?;
    Ok(table.count_rows(Some(format!("tenant_id = {}", tenant.as_u64()))).await?)
  }

  /// Number of a tenant's documents in the given status.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn count_documents_by_status(&self, tenant: TenantId, status: DocumentStatus) -> Result<usize> {
    let table = self.documents_table().await?;
    Ok(
      table
        .count_rows(Some(format!(
          "tenant_id = {} AND status = '{}'",
          tenant.as_u64(),
          status.as_str()
        )))
        .await?,
    )
  }

  /// Delete a document row. Chunk and vector cleanup is the orchestrator's
  /// responsibility and must happen before this call.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn delete_document(&self, id: &str) -> Result<()> {
    debug!(table = "documents", operation = "delete", id, "Deleting document");
    let table = self.documents_table().await?;
    table.delete(&format!("id = '{}'", escape(id))).await?;
    Ok(())
  }
}

/// Convert a Document to an Arrow RecordBatch
fn document_to_batch(doc: &Document) -> Result<RecordBatch> {
  let id = StringArray::from(vec![doc.id.to_string()]);
  let tenant_id = UInt64Array::from(vec![doc.tenant_id.as_u64()]);
  let file_name = StringArray::from(vec![doc.file_name.clone()]);
  let file_path = StringArray::from(vec![doc.file_path.clone()]);
  let file_type = StringArray::from(vec![doc.file_type.clone()]);
  let file_size = UInt64Array::from(vec![doc.file_size]);
  let status = StringArray::from(vec![doc.status.as_str().to_string()]);
  let progress_stage = StringArray::from(vec![doc.progress_stage.map(|s| s.as_str().to_string())]);
  let progress_percent = UInt32Array::from(vec![doc.progress_percent as u32]);
  let chunk_count = UInt32Array::from(vec![doc.chunk_count as u32]);
  let content_hash = StringArray::from(vec![doc.content_hash.clone()]);
  let version = UInt32Array::from(vec![doc.version]);
  let language = StringArray::from(vec![doc.language.clone()]);
  let category = StringArray::from(vec![doc.category.clone()]);
  let tags = StringArray::from(vec![serde_json::to_string(&doc.tags)?]);
  let extracted_metadata = StringArray::from(vec![serde_json::to_string(&doc.extracted_metadata)?]);
  let error_message = StringArray::from(vec![doc.error_message.clone()]);
  let batch_id = StringArray::from(vec![doc.batch_id.map(|b| b.to_string())]);
  let created_at = Int64Array::from(vec![doc.created_at.timestamp_millis()]);
  let updated_at = Int64Array::from(vec![doc.updated_at.timestamp_millis()]);

  let batch = RecordBatch::try_new(
    documents_schema(),
    vec![
      std::sync::Arc::new(id),
      std::sync::Arc::new(tenant_id),
      std::sync::Arc::new(file_name),
      std::sync::Arc::new(file_path),
      std::sync::Arc::new(file_type),
      std::sync::Arc::new(file_size),
      std::sync::Arc::new(status),
      std::sync::Arc::new(progress_stage),
      std::sync::Arc::new(progress_percent),
      std::sync::Arc::new(chunk_count),
      std::sync::Arc::new(content_hash),
      std::sync::Arc::new(version),
      std::sync::Arc::new(language),
      std::sync::Arc::new(category),
      std::sync::Arc::new(tags),
      std::sync::Arc::new(extracted_metadata),
      std::sync::Arc::new(error_message),
      std::sync::Arc::new(batch_id),
      std::sync::Arc::new(created_at),
      std::sync::Arc::new(updated_at),
    ],
  )?;

  Ok(batch)
}

/// Convert a RecordBatch row to a Document
pub(in crate::db) fn batch_to_document(batch: &RecordBatch, row: usize) -> Result<Document> {
  let get_string = |name: &str| -> Result<String> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .map(|a| a.value(row).to_string())
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
  };

  let get_opt_string = |name: &str| -> Result<Option<String>> {
    let array = batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))?;
    if array.is_null(row) {
      Ok(None)
    } else {
      Ok(Some(array.value(row).to_string()))
    }
  };

  let get_u32 = |name: &str| -> Result<u32> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
      .map(|a| a.value(row))
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
  };

  let get_u64 = |name: &str| -> Result<u64> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
      .map(|a| a.value(row))
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
  };

  let get_i64 = |name: &str| -> Result<i64> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
      .map(|a| a.value(row))
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
  };

  let status = get_string("status")?
    .parse::<DocumentStatus>()
    .map_err(DbError::InvalidInput)?;
  let progress_stage = match get_opt_string("progress_stage")? {
    Some(s) => Some(s.parse().map_err(DbError::InvalidInput)?),
    None => None,
  };

  let created_at = Utc
    .timestamp_millis_opt(get_i64("created_at")?)
    .single()
    .ok_or_else(|| DbError::InvalidInput("invalid created_at timestamp".into()))?;
  let updated_at = Utc
    .timestamp_millis_opt(get_i64("updated_at")?)
    .single()
    .ok_or_else(|| DbError::InvalidInput("invalid updated_at timestamp".into()))?;

  Ok(Document {
    id: get_string("id")?
      .parse()
      .map_err(|_| DbError::InvalidInput("invalid document id".into()))?,
    tenant_id: TenantId(get_u64("tenant_id")?),
    file_name: get_string("file_name")?,
    file_path: get_string("file_path")?,
    file_type: get_string("file_type")?,
    file_size: get_u64("file_size")?,
    status,
    progress_stage,
    progress_percent: get_u32("progress_percent")? as u8,
    chunk_count: get_u32("chunk_count")? as usize,
    content_hash: get_opt_string("content_hash")?,
    version: get_u32("version")?,
    language: get_opt_string("language")?,
    category: get_opt_string("category")?,
    tags: serde_json::from_str(&get_string("tags")?)?,
    extracted_metadata: serde_json::from_str(&get_string("extracted_metadata")?)?,
    error_message: get_opt_string("error_message")?,
    batch_id: match get_opt_string("batch_id")? {
      Some(b) => Some(b.parse().map_err(|_| DbError::InvalidInput("invalid batch id".into()))?),
      None => None,
    },
    created_at,
    updated_at,
  })
}
