//! Document-facing service operations: upload, listing, status, chunks,
//! versions, metadata, and lifecycle.

use base64::Engine as _;

use super::{Services, error::ServiceError};
use crate::{
  domain::{
    document::{Batch, Document, DocumentId, DocumentVersion},
    tenant::TenantId,
  },
  ingest::orchestrator::UploadRequest,
  jobs::Job,
};

fn decode_content(content_base64: &str) -> Result<Vec<u8>, ServiceError> {
  base64::engine::general_purpose::STANDARD
    .decode(content_base64)
    .map_err(|e| ServiceError::internal(format!("invalid base64 content: {e}")))
}

fn parse_document_id(raw: &str) -> Result<DocumentId, ServiceError> {
  raw
    .parse()
    .map_err(|_| ServiceError::not_found("document", raw.to_string()))
}

impl Services {
  /// Admit an upload and queue its processing job.
  pub async fn upload_document(
    &self,
    tenant: TenantId,
    file_name: String,
    file_type: String,
    content_base64: &str,
  ) -> Result<Document, ServiceError> {
    let bytes = decode_content(content_base64)?;
    let document = self
      .orchestrator
      .upload(
        tenant,
        UploadRequest {
          file_name,
          file_type,
          bytes,
        },
      )
      .await?;

    self
      .jobs
      .enqueue(Job::Process {
        tenant,
        document_id: document.id,
      })
      .await?;

    Ok(document)
  }

  /// Admit a batch atomically and queue the fan-out job.
  pub async fn batch_upload(
    &self,
    tenant: TenantId,
    files: Vec<(String, String, String)>,
  ) -> Result<Batch, ServiceError> {
    let mut requests = Vec::with_capacity(files.len());
    for (file_name, file_type, content_base64) in files {
      requests.push(UploadRequest {
        file_name,
        file_type,
        bytes: decode_content(&content_base64)?,
      });
    }

    let (batch, _documents) = self.orchestrator.batch_upload(tenant, requests).await?;
    self
      .jobs
      .enqueue(Job::Batch {
        tenant,
        batch_id: batch.id.to_string(),
      })
      .await?;

    Ok(batch)
  }

  pub async fn get_batch(&self, tenant: TenantId, batch_id: &str) -> Result<Batch, ServiceError> {
    self
      .db
      .get_batch(tenant, batch_id)
      .await?
      .ok_or_else(|| ServiceError::not_found("batch", batch_id))
  }

  pub async fn list_documents(&self, tenant: TenantId) -> Result<Vec<Document>, ServiceError> {
    Ok(self.db.list_documents(tenant).await?)
  }

  pub async fn get_document(&self, tenant: TenantId, document_id: &str) -> Result<Document, ServiceError> {
    self
      .db
      .get_document(tenant, document_id)
      .await?
      .ok_or_else(|| ServiceError::not_found("document", document_id))
  }

  /// Queue a content update (partial reindex runs in the background; poll
  /// the status endpoint for completion).
  pub async fn update_document(
    &self,
    tenant: TenantId,
    document_id: &str,
    file_name: Option<String>,
    content_base64: &str,
  ) -> Result<Document, ServiceError> {
    let id = parse_document_id(document_id)?;
    let document = self.get_document(tenant, document_id).await?;
    let bytes = decode_content(content_base64)?;

    self
      .jobs
      .enqueue(Job::Update {
        tenant,
        document_id: id,
        bytes,
        new_file_name: file_name,
      })
      .await?;

    Ok(document)
  }

  pub async fn delete_document(&self, tenant: TenantId, document_id: &str) -> Result<(), ServiceError> {
    let id = parse_document_id(document_id)?;
    self.orchestrator.delete(tenant, id).await
  }

  /// Rollback runs synchronously: the response reflects the reindexed state.
  pub async fn rollback_document(
    &self,
    tenant: TenantId,
    document_id: &str,
    version_number: u32,
  ) -> Result<Document, ServiceError> {
    let id = parse_document_id(document_id)?;
    self.orchestrator.rollback(tenant, id, version_number).await
  }

  pub async fn document_versions(&self, tenant: TenantId, document_id: &str) -> Result<Vec<DocumentVersion>, ServiceError> {
    // Ownership check before exposing version rows.
    self.get_document(tenant, document_id).await?;
    Ok(self.db.list_document_versions(document_id).await?)
  }

  pub async fn document_chunks(
    &self,
    tenant: TenantId,
    document_id: &str,
    page: usize,
    page_size: usize,
  ) -> Result<(Vec<crate::domain::document::Chunk>, usize), ServiceError> {
    let document = self.get_document(tenant, document_id).await?;
    let chunks = self.db.list_chunks(document_id, page, page_size.clamp(1, 100)).await?;
    Ok((chunks, document.chunk_count))
  }

  /// Patch category/tags. Vector payloads pick the change up on the next
  /// reindex.
  pub async fn update_document_metadata(
    &self,
    tenant: TenantId,
    document_id: &str,
    category: Option<String>,
    tags: Option<Vec<String>>,
  ) -> Result<Document, ServiceError> {
    let mut document = self.get_document(tenant, document_id).await?;
    if let Some(category) = category {
      document.category = Some(category);
    }
    if let Some(tags) = tags {
      document.tags = tags;
    }
    document.updated_at = chrono::Utc::now();
    self.db.upsert_document(&document).await?;
    Ok(document)
  }
}
