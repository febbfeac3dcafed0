// Chunks table operations.
//
// Chunk rows hold text and metadata only; their vectors live in the
// per-tenant collections keyed by the same id. Orchestrator ordering rules
// require chunk ids to exist before any vector write.

use arrow_array::{Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array, UInt64Array};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use tracing::debug;

use crate::{
  db::{
    connection::{DbError, KbDb, Result, escape},
    schema::chunks_schema,
  },
  domain::{
    document::{Chunk, ChunkMetadata},
    tenant::TenantId,
  },
};

/// A chunk row together with its owning tenant (needed by index backfill).
#[derive(Debug, Clone)]
pub struct StoredChunk {
  pub chunk: Chunk,
  pub tenant_id: TenantId,
}

impl KbDb {
  /// Add chunk rows in a batch.
  #[tracing::instrument(level = "trace", skip(self, chunks), fields(batch_size = chunks.len()))]
  pub async fn add_chunks(&self, tenant: TenantId, chunks: &[Chunk]) -> Result<()> {
    if chunks.is_empty() {
      return Ok(());
    }

    debug!(
      table = "chunks",
      operation = "batch_insert",
      batch_size = chunks.len(),
      "Adding chunks batch"
    );

    let table = self.chunks_table().await?;
    let batches: Vec<RecordBatch> = chunks
      .iter()
      .map(|chunk| chunk_to_batch(tenant, chunk))
      .collect::<Result<Vec<_>>>()?;

    let iter = RecordBatchIterator::new(batches.into_iter().map(Ok), chunks_schema());
    table.add(Box::new(iter)).execute().await?;
    Ok(())
  }

  /// Replace one chunk row in place (partial reindex updates).
  #[tracing::instrument(level = "trace", skip(self, chunk), fields(id = %chunk.id))]
  pub async fn update_chunk(&self, tenant: TenantId, chunk: &Chunk) -> Result<()> {
    let table = self.chunks_table().await?;
    table.delete(&format!("id = '{}'", chunk.id)).await.ok();

    let batch = chunk_to_batch(tenant, chunk)?;
    let batches = RecordBatchIterator::new(vec![Ok(batch)], chunks_schema());
    table.add(Box::new(batches)).execute().await?;
    Ok(())
  }

  /// Fetch chunk rows by id, in one query.
  #[tracing::instrument(level = "trace", skip(self, ids), fields(count = ids.len()))]
  pub async fn get_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }

    let id_list = ids
      .iter()
      .map(|id| format!("'{}'", escape(id)))
      .collect::<Vec<_>>()
      .join(", ");

    let table = self.chunks_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("id IN ({id_list})"))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut chunks = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        chunks.push(batch_to_chunk(&batch, row)?);
      }
    }
    Ok(chunks)
  }

  /// A document's chunks ordered by index, optionally paginated.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn list_chunks(&self, document_id: &str, page: usize, page_size: usize) -> Result<Vec<Chunk>> {
    let table = self.chunks_table().await?;
    let results: Vec<RecordBatch> = table
      .query()
      .only_if(format!("document_id = '{}'", escape(document_id)))
      .execute()
      .await?
      .try_collect()
      .await?;

    let mut chunks = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        chunks.push(batch_to_chunk(&batch, row)?);
      }
    }
    chunks.sort_by_key(|c| c.chunk_index);

    if page_size > 0 {
      let start = page.saturating_sub(1) * page_size;
      chunks = chunks.into_iter().skip(start).take(page_size).collect();
    }
    Ok(chunks)
  }

  /// All of a document's chunks ordered by index.
  pub async fn all_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
    self.list_chunks(document_id, 0, 0).await
  }

  /// Every chunk row with its tenant (keyword-index backfill).
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn all_stored_chunks(&self) -> Result<Vec<StoredChunk>> {
    let table = self.chunks_table().await?;
    let results: Vec<RecordBatch> = table.query().execute().await?.try_collect().await?;

    let mut stored = Vec::new();
    for batch in results {
      for row in 0..batch.num_rows() {
        let tenant = tenant_of(&batch, row)?;
        stored.push(StoredChunk {
          chunk: batch_to_chunk(&batch, row)?,
          tenant_id: tenant,
        });
      }
    }
    Ok(stored)
  }

  /// Delete chunk rows by id.
  #[tracing::instrument(level = "trace", skip(self, ids), fields(count = ids.len()))]
  pub async fn delete_chunks_by_ids(&self, ids: &[String]) -> Result<()> {
    if ids.is_empty() {
      return Ok(());
    }
    let id_list = ids
      .iter()
      .map(|id| format!("'{}'", escape(id)))
      .collect::<Vec<_>>()
      .join(", ");

    let table = self.chunks_table().await?;
    table.delete(&format!("id IN ({id_list})")).await?;
    Ok(())
  }

  /// Delete every chunk of a document (cascade path).
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn delete_chunks_by_document(&self, document_id: &str) -> Result<()> {
    debug!(
      table = "chunks",
      operation = "delete_by_document",
      document_id,
      "Deleting document chunks"
    );
    let table = self.chunks_table().await?;
    table.delete(&format!("document_id = '{}'", escape(document_id))).await?;
    Ok(())
  }

  /// Chunk count for one tenant (drift diagnostics).
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn count_chunks(&self, tenant: TenantId) -> Result<usize> {
    let table = self.chunks_table().await?;
    Ok(table.count_rows(Some(format!("tenant_id = {}", tenant.as_u64()))).await?)
  }

  /// Total chunk rows (keyword-index backfill comparison).
  pub async fn count_all_chunks(&self) -> Result<usize> {
    let table = self.chunks_table().await?;
    Ok(table.count_rows(None).await?)
  }
}

fn chunk_to_batch(tenant: TenantId, chunk: &Chunk) -> Result<RecordBatch> {
  let id = StringArray::from(vec![chunk.id.to_string()]);
  let document_id = StringArray::from(vec![chunk.document_id.to_string()]);
  let tenant_id = UInt64Array::from(vec![tenant.as_u64()]);
  let chunk_index = UInt32Array::from(vec![chunk.chunk_index as u32]);
  let text = StringArray::from(vec![chunk.text.clone()]);
  let start_char = UInt64Array::from(vec![chunk.start_char as u64]);
  let end_char = UInt64Array::from(vec![chunk.end_char as u64]);
  let metadata = StringArray::from(vec![serde_json::to_string(&chunk.metadata)?]);
  let created_at = Int64Array::from(vec![chrono::Utc::now().timestamp_millis()]);

  let batch = RecordBatch::try_new(
    chunks_schema(),
    vec![
      std::sync::Arc::new(id),
      std::sync::Arc::new(document_id),
      std::sync::Arc::new(tenant_id),
      std::sync::Arc::new(chunk_index),
      std::sync::Arc::new(text),
      std::sync::Arc::new(start_char),
      std::sync::Arc::new(end_char),
      std::sync::Arc::new(metadata),
      std::sync::Arc::new(created_at),
    ],
  )?;

  Ok(batch)
}

fn tenant_of(batch: &RecordBatch, row: usize) -> Result<TenantId> {
  batch
    .column_by_name("tenant_id")
    .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
    .map(|a| TenantId(a.value(row)))
    .ok_or_else(|| DbError::NotFound("column tenant_id".into()))
}

pub(in crate::db) fn batch_to_chunk(batch: &RecordBatch, row: usize) -> Result<Chunk> {
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

  let get_u64 = |name: &str| -> Result<u64> {
    batch
      .column_by_name(name)
      .and_then(|c| c.as_any().downcast_ref::<UInt64Array>())
      .map(|a| a.value(row))
      .ok_or_else(|| DbError::NotFound(format!("column {}", name)))
  };

  let metadata: ChunkMetadata = serde_json::from_str(&get_string("metadata")?)?;

  Ok(Chunk {
    id: get_string("id")?
      .parse()
      .map_err(|_| DbError::InvalidInput("invalid chunk id".into()))?,
    document_id: get_string("document_id")?
      .parse()
      .map_err(|_| DbError::InvalidInput("invalid document id".into()))?,
    chunk_index: get_u32("chunk_index")? as usize,
    text: get_string("text")?,
    start_char: get_u64("start_char")? as usize,
    end_char: get_u64("end_char")? as usize,
    metadata,
  })
}
