//! Drift diagnostics: compares the chunks table against the tenant's vector
//! collection and reports mismatches as human-readable diagnosis strings.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
  db::KbDb,
  domain::{document::DocumentStatus, tenant::TenantId},
  service::error::ServiceError,
  vector::{CollectionDiagnostics, VectorStore},
};

/// Database-side counts used in the comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbSideInfo {
  pub space_exists: bool,
  pub documents_count: usize,
  pub completed_documents_count: usize,
  pub total_chunks_count: usize,
  pub chunk_ids_sample: Vec<String>,
}

/// Full diagnostics payload for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
  pub vector: CollectionDiagnostics,
  pub db: DbSideInfo,
  pub diagnosis: Vec<String>,
}

/// Build the drift report for a tenant.
pub async fn drift_report(db: &Arc<KbDb>, vector: &Arc<VectorStore>, tenant: TenantId) -> Result<DriftReport, ServiceError> {
  let collection = vector.diagnostics(tenant).await?;

  let space_exists = db.get_space(tenant).await?.is_some();
  let documents_count = db.count_documents(tenant).await?;
  let completed_documents_count = db.count_documents_by_status(tenant, DocumentStatus::Completed).await?;
  let total_chunks_count = db.count_chunks(tenant).await?;

  let chunk_ids_sample = {
    let mut sample = Vec::new();
    for document in db.list_documents(tenant).await? {
      if document.status != DocumentStatus::Completed {
        continue;
      }
      for chunk in db.list_chunks(&document.id.to_string(), 1, 5).await? {
        sample.push(chunk.id.to_string());
        if sample.len() >= 5 {
          break;
        }
      }
      if sample.len() >= 5 {
        break;
      }
    }
    sample
  };

  let mut diagnosis = Vec::new();
  if !collection.collection_exists {
    diagnosis.push("ISSUE: vector collection does not exist for this tenant".to_string());
  } else if collection.points_count == 0 {
    diagnosis.push("ISSUE: vector collection exists but has 0 points".to_string());
  }

  if total_chunks_count > 0 && collection.points_count == 0 {
    diagnosis.push("ISSUE: database has chunks but the vector store has no points - embeddings not stored".to_string());
  }

  if total_chunks_count != collection.points_count {
    diagnosis.push(format!(
      "WARNING: chunk count mismatch - database: {total_chunks_count}, vector store: {}",
      collection.points_count
    ));
  }

  if diagnosis.is_empty() {
    diagnosis.push("OK: vector collection and database chunks appear synchronized".to_string());
  }

  Ok(DriftReport {
    vector: collection,
    db: DbSideInfo {
      space_exists,
      documents_count,
      completed_documents_count,
      total_chunks_count,
      chunk_ids_sample,
    },
    diagnosis,
  })
}
