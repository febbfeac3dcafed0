//! Per-tenant vector collection adapter.
//!
//! Each tenant owns one collection named `<prefix><tenant_id>` holding one
//! point per chunk (`point_id == chunk_id`) plus the payload columns used for
//! filtered search. The invariant maintained by the ingestion orchestrator:
//! the point-id set equals the chunk-id set of the tenant's completed
//! documents.

use arrow_array::{
  Array, BooleanArray, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray, UInt32Array,
  UInt64Array,
};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
  config::VectorConfig,
  db::{DbError, KbDb, Result, points_schema},
  domain::tenant::TenantId,
};

/// One vector point: a chunk's embedding plus its search payload.
#[derive(Debug, Clone)]
pub struct VectorPoint {
  pub chunk_id: String,
  pub document_id: String,
  pub tenant_id: TenantId,
  pub document_type: Option<String>,
  pub category: Option<String>,
  pub page_number: Option<u32>,
  pub section_title: Option<String>,
  pub has_table: bool,
  pub has_code: bool,
  pub vector: Vec<f32>,
}

/// Payload filter for dense search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub document_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub document_type: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
}

impl SearchFilter {
  pub fn is_empty(&self) -> bool {
    self.document_id.is_none() && self.document_type.is_none() && self.category.is_none()
  }

  fn to_expression(&self) -> Option<String> {
    let mut clauses = Vec::new();
    if let Some(id) = &self.document_id {
      clauses.push(format!("document_id = '{}'", id.replace('\'', "''")));
    }
    if let Some(t) = &self.document_type {
      clauses.push(format!("document_type = '{}'", t.replace('\'', "''")));
    }
    if let Some(c) = &self.category {
      clauses.push(format!("category = '{}'", c.replace('\'', "''")));
    }
    if clauses.is_empty() { None } else { Some(clauses.join(" AND ")) }
  }
}

/// Storage estimates for a tenant's collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionMetrics {
  pub enabled: bool,
  pub compression_type: String,
  pub points_count: usize,
  pub vector_size: usize,
  pub uncompressed_bytes: u64,
  pub compressed_bytes: u64,
  pub ratio: f64,
  pub savings_pct: f64,
}

/// Collection health snapshot used by drift diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDiagnostics {
  pub collection_name: String,
  pub collection_exists: bool,
  pub points_count: usize,
  pub dims: usize,
  pub sample_payload_keys: Vec<String>,
}

/// Adapter over the per-tenant collections.
pub struct VectorStore {
  db: Arc<KbDb>,
  config: VectorConfig,
}

impl VectorStore {
  pub fn new(db: Arc<KbDb>, config: VectorConfig) -> Self {
    Self { db, config }
  }

  fn collection_name(&self, tenant: TenantId) -> String {
    tenant.collection_name(&self.config.collection_prefix)
  }

  async fn collection_exists(&self, name: &str) -> Result<bool> {
    let tables = self.db.connection.table_names().execute().await?;
    Ok(tables.contains(&name.to_string()))
  }

  /// Create the tenant's collection if it does not exist. Idempotent.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn ensure_collection(&self, tenant: TenantId) -> Result<()> {
    let name = self.collection_name(tenant);
    if self.collection_exists(&name).await? {
      return Ok(());
    }

    debug!(collection = %name, dims = self.db.vector_dim, "Creating vector collection");
    self
      .db
      .connection
      .create_empty_table(&name, points_schema(self.db.vector_dim))
      .execute()
      .await?;
    Ok(())
  }

  /// Insert or replace points at their chunk ids.
  #[tracing::instrument(level = "trace", skip(self, points), fields(count = points.len()))]
  pub async fn upsert_points(&self, tenant: TenantId, points: &[VectorPoint]) -> Result<()> {
    if points.is_empty() {
      return Ok(());
    }

    self.ensure_collection(tenant).await?;
    let name = self.collection_name(tenant);
    let table = self.db.connection.open_table(&name).execute().await?;

    let id_list = points
      .iter()
      .map(|p| format!("'{}'", p.chunk_id.replace('\'', "''")))
      .collect::<Vec<_>>()
      .join(", ");
    table.delete(&format!("id IN ({id_list})")).await.ok();

    let batches: Vec<RecordBatch> = points
      .iter()
      .map(|p| point_to_batch(p, self.db.vector_dim))
      .collect::<Result<Vec<_>>>()?;
    let iter = RecordBatchIterator::new(batches.into_iter().map(Ok), points_schema(self.db.vector_dim));
    table.add(Box::new(iter)).execute().await?;

    debug!(collection = %name, points = points.len(), "Upserted vector points");
    Ok(())
  }

  /// Delete points by chunk id.
  #[tracing::instrument(level = "trace", skip(self, chunk_ids), fields(count = chunk_ids.len()))]
  pub async fn delete_points_by_chunk_ids(&self, tenant: TenantId, chunk_ids: &[String]) -> Result<()> {
    if chunk_ids.is_empty() {
      return Ok(());
    }
    let name = self.collection_name(tenant);
    if !self.collection_exists(&name).await? {
      return Ok(());
    }

    let table = self.db.connection.open_table(&name).execute().await?;
    let id_list = chunk_ids
      .iter()
      .map(|id| format!("'{}'", id.replace('\'', "''")))
      .collect::<Vec<_>>()
      .join(", ");
    table.delete(&format!("id IN ({id_list})")).await?;
    Ok(())
  }

  /// Delete every point of a document.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn delete_points_by_document(&self, tenant: TenantId, document_id: &str) -> Result<()> {
    let name = self.collection_name(tenant);
    if !self.collection_exists(&name).await? {
      return Ok(());
    }

    let table = self.db.connection.open_table(&name).execute().await?;
    table
      .delete(&format!("document_id = '{}'", document_id.replace('\'', "''")))
      .await?;
    Ok(())
  }

  /// Cosine-style dense search. Returns `(chunk_id, score)` with scores in
  /// [0, 1], best first. A missing collection yields no results.
  #[tracing::instrument(level = "trace", skip(self, query_vector))]
  pub async fn search(
    &self,
    tenant: TenantId,
    query_vector: &[f32],
    k: usize,
    filter: Option<&SearchFilter>,
  ) -> Result<Vec<(String, f32)>> {
    let name = self.collection_name(tenant);
    if !self.collection_exists(&name).await? {
      warn!(collection = %name, "Vector search against missing collection");
      return Ok(Vec::new());
    }

    let table = self.db.connection.open_table(&name).execute().await?;
    let expression = filter.and_then(|f| f.to_expression());

    let query = match expression {
      Some(expr) => table.vector_search(query_vector.to_vec())?.limit(k).only_if(expr),
      None => table.vector_search(query_vector.to_vec())?.limit(k),
    };

    let results: Vec<RecordBatch> = query.execute().await?.try_collect().await?;

    let mut hits = Vec::new();
    for batch in results {
      let ids = batch
        .column_by_name("id")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| DbError::NotFound("column id".into()))?;
      let distances = batch
        .column_by_name("_distance")
        .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

      for row in 0..batch.num_rows() {
        let distance = distances.map(|d| d.value(row)).unwrap_or(0.0);
        let score = (1.0 - distance.min(1.0)).max(0.0);
        hits.push((ids.value(row).to_string(), score));
      }
    }

    debug!(collection = %name, results = hits.len(), "Vector search complete");
    Ok(hits)
  }

  /// Total points in a tenant's collection.
  pub async fn points_count(&self, tenant: TenantId) -> Result<usize> {
    let name = self.collection_name(tenant);
    if !self.collection_exists(&name).await? {
      return Ok(0);
    }
    let table = self.db.connection.open_table(&name).execute().await?;
    Ok(table.count_rows(None).await?)
  }

  /// Storage estimates assuming int8 scalar quantization when enabled.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn compression_metrics(&self, tenant: TenantId) -> Result<CompressionMetrics> {
    let points_count = self.points_count(tenant).await?;
    let vector_size = self.db.vector_dim;

    let uncompressed = (points_count * vector_size * std::mem::size_of::<f32>()) as u64;
    let compressed = if self.config.compression_enabled {
      (points_count * vector_size) as u64
    } else {
      uncompressed
    };
    let ratio = if compressed > 0 {
      uncompressed as f64 / compressed as f64
    } else {
      1.0
    };
    let savings_pct = if uncompressed > 0 {
      (1.0 - compressed as f64 / uncompressed as f64) * 100.0
    } else {
      0.0
    };

    Ok(CompressionMetrics {
      enabled: self.config.compression_enabled,
      compression_type: self.config.compression_type.clone(),
      points_count,
      vector_size,
      uncompressed_bytes: uncompressed,
      compressed_bytes: compressed,
      ratio,
      savings_pct,
    })
  }

  /// Health snapshot for drift diagnostics.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn diagnostics(&self, tenant: TenantId) -> Result<CollectionDiagnostics> {
    let name = self.collection_name(tenant);
    if !self.collection_exists(&name).await? {
      return Ok(CollectionDiagnostics {
        collection_name: name,
        collection_exists: false,
        points_count: 0,
        dims: self.db.vector_dim,
        sample_payload_keys: Vec::new(),
      });
    }

    let table = self.db.connection.open_table(&name).execute().await?;
    let points_count = table.count_rows(None).await?;

    let sample: Vec<RecordBatch> = table.query().limit(1).execute().await?.try_collect().await?;
    let sample_payload_keys = sample
      .first()
      .map(|batch| {
        batch
          .schema()
          .fields()
          .iter()
          .map(|f| f.name().clone())
          .filter(|n| n != "vector")
          .collect()
      })
      .unwrap_or_default();

    Ok(CollectionDiagnostics {
      collection_name: name,
      collection_exists: true,
      points_count,
      dims: self.db.vector_dim,
      sample_payload_keys,
    })
  }
}

fn point_to_batch(point: &VectorPoint, vector_dim: usize) -> Result<RecordBatch> {
  let id = StringArray::from(vec![point.chunk_id.clone()]);
  let document_id = StringArray::from(vec![point.document_id.clone()]);
  let tenant_id = UInt64Array::from(vec![point.tenant_id.as_u64()]);
  let document_type = StringArray::from(vec![point.document_type.clone()]);
  let category = StringArray::from(vec![point.category.clone()]);
  let page_number = UInt32Array::from(vec![point.page_number]);
  let section_title = StringArray::from(vec![point.section_title.clone()]);
  let has_table = BooleanArray::from(vec![point.has_table]);
  let has_code = BooleanArray::from(vec![point.has_code]);

  let mut padded = point.vector.clone();
  padded.resize(vector_dim, 0.0);
  let values = Float32Array::from(padded);
  let field = Arc::new(arrow_schema::Field::new("item", arrow_schema::DataType::Float32, true));
  let vector = FixedSizeListArray::try_new(field, vector_dim as i32, Arc::new(values), None)?;

  let batch = RecordBatch::try_new(
    points_schema(vector_dim),
    vec![
      Arc::new(id),
      Arc::new(document_id),
      Arc::new(tenant_id),
      Arc::new(document_type),
      Arc::new(category),
      Arc::new(page_number),
      Arc::new(section_title),
      Arc::new(has_table),
      Arc::new(has_code),
      Arc::new(vector),
    ],
  )?;

  Ok(batch)
}
