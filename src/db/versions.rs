// Document version snapshots for rollback.

use arrow_array::{Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array};
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use uuid::Uuid;

use crate::{
  db::{
    connection::{DbError, KbDb, Result, escape},
    schema::document_versions_schema,
  },
  domain::document::DocumentVersion,
};

impl KbDb {
  /// Record a version snapshot.
  #[tracing::instrument(level = "trace", skip(self, version), fields(document_id = %version.document_id, version = version.version_number))]
  pub async fn add_document_version(&self, version: &DocumentVersion) -> Result<()> {
    let table = self.document_versions_table().await?;
    let batch = version_to_batch(version)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], document_versions_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// Attach a reindex change summary to an existing version row.
  #[tracing::instrument(level = "trace", skip(self, version))]
  pub async fn update_document_version(&self, version: &DocumentVersion) -> Result<()> {
    let table = self.document_versions_table().await?;
    table
      .delete(&format!(
        "document_id = '{}' AND version_number = {}",
        version.document_id, version.version_number
      ))
      .await
      .ok();

    let batch = version_to_batch(version)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], document_versions_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// All versions of a document, newest first.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn list_document_versions(&self, document_id: &str) -> Result<Vec<DocumentVersion>> {
    let table = self.document_versions_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("document_id = '{}'", escape(document_id)))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut versions = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        versions.push(batch_to_version(&batch, row)?);
      }
    }
    versions.sort_by(|a, b| b.version_number.cmp(&a.version_number));
    Ok(versions)
  }

  /// Fetch one version of a document.
  pub async fn get_document_version(&self, document_id: &str, version_number: u32) -> Result<Option<DocumentVersion>> {
    let versions = self.list_document_versions(document_id).await?;
    Ok(versions.into_iter().find(|v| v.version_number == version_number))
  }

  /// Delete all versions of a document (cascade path).
  pub async fn delete_document_versions(&self, document_id: &str) -> Result<()> {
    let table = self.document_versions_table().await?;
    table.delete(&format!("document_id = '{}'", escape(document_id))).await?;
    Ok(())
  }
}

fn version_to_batch(version: &DocumentVersion) -> Result<RecordBatch> {
  let id = StringArray::from(vec![Uuid::new_v4().to_string()]);
  let document_id = StringArray::from(vec![version.document_id.to_string()]);
  let version_number = UInt32Array::from(vec![version.version_number]);
  let file_path = StringArray::from(vec![version.file_path.clone()]);
  let file_hash = StringArray::from(vec![version.file_hash.clone()]);
  let chunk_count = UInt32Array::from(vec![version.chunk_count as u32]);
  let change_summary = StringArray::from(vec![
    version
      .change_summary
      .as_ref()
      .map(serde_json::to_string)
      .transpose()?,
  ]);
  let created_at = Int64Array::from(vec![version.created_at.timestamp_millis()]);

  let batch = RecordBatch::try_new(
    document_versions_schema(),
    vec![
      std::sync::Arc::new(id),
      std::sync::Arc::new(document_id),
      std::sync::Arc::new(version_number),
      std::sync::Arc::new(file_path),
      std::sync::Arc::new(file_hash),
      std::sync::Arc::new(chunk_count),
      std::sync::Arc::new(change_summary),
      std::sync::Arc::new(created_at),
    ],
  )?;

  Ok(batch)
}

fn batch_to_version(batch: &RecordBatch, row: usize) -> Result<DocumentVersion> {
  let get_string = |name: &str| -> Result<String> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<StringArray>())
      .map(|a| a.value(row).to_string())
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
  };

  let change_summary_col = batch
    .column_by_name("change_summary")
    .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    .ok_or_else(|| DbError::NotFound("column change_summary".into()))?;
  let change_summary = if change_summary_col.is_null(row) {
    None
  } else {
    Some(serde_json::from_str(change_summary_col.value(row))?)
  };

  let version_number = batch
    .column_by_name("version_number")
    .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column version_number".into()))?;

  let chunk_count = batch
    .column_by_name("chunk_count")
    .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column chunk_count".into()))?;

  let created_ms = batch
    .column_by_name("created_at")
    .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    .map(|a| a.value(row))
    .ok_or_else(|| DbError::NotFound("column created_at".into()))?;

  Ok(DocumentVersion {
    document_id: get_string("document_id")?
      .parse()
      .map_err(|_| DbError::InvalidInput("invalid document id".into()))?,
    version_number,
    file_path: get_string("file_path")?,
    file_hash: get_string("file_hash")?,
    chunk_count: chunk_count as usize,
    change_summary,
    created_at: Utc
      .timestamp_millis_opt(created_ms)
      .single()
      .ok_or_else(|| DbError::InvalidInput("invalid created_at timestamp".into()))?,
  })
}
