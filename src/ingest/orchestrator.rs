//! Ingestion orchestration: upload admission, the per-document processing
//! state machine, partial reindex, versioning/rollback and batch fan-out.
//!
//! Ordering invariant maintained here: chunk rows (and therefore chunk ids)
//! exist before any vector write; a vector-write failure rolls the chunk rows
//! back, and a document-commit failure after a successful vector write
//! triggers a compensating vector delete. The keyword index is updated only
//! after both stores agree.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{
  chunker::Chunker,
  cleaner::{self, CleanRules},
  processor::{self, Extraction},
  storage::{DocumentStorage, canonical_file_name, content_hash},
};
use crate::{
  config::Config,
  db::KbDb,
  domain::{
    document::{
      Batch, ChangeSummary, Chunk, Document, DocumentId, DocumentStatus, DocumentVersion, ProcessingStage,
    },
    tenant::{ProcessingRules, SegmentationMode, TenantId},
  },
  embed_cache::EmbeddingCache,
  keyword::KeywordIndex,
  limits::TenantLimiter,
  provider::OcrBackend,
  service::error::ServiceError,
  vector::{VectorPoint, VectorStore},
};

/// One file submitted for upload (admission input).
#[derive(Debug, Clone)]
pub struct UploadRequest {
  pub file_name: String,
  pub file_type: String,
  pub bytes: Vec<u8>,
}

pub struct Orchestrator {
  db: Arc<KbDb>,
  vector: Arc<VectorStore>,
  keyword: Arc<KeywordIndex>,
  cache: Arc<EmbeddingCache>,
  limiter: Arc<TenantLimiter>,
  chunker: Arc<Chunker>,
  ocr: Option<Arc<dyn OcrBackend>>,
  storage: DocumentStorage,
  config: Arc<Config>,
}

impl Orchestrator {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    db: Arc<KbDb>,
    vector: Arc<VectorStore>,
    keyword: Arc<KeywordIndex>,
    cache: Arc<EmbeddingCache>,
    limiter: Arc<TenantLimiter>,
    chunker: Arc<Chunker>,
    ocr: Option<Arc<dyn OcrBackend>>,
    config: Arc<Config>,
  ) -> Self {
    let storage = DocumentStorage::new(config.ingest.storage_dir.clone());
    Self {
      db,
      vector,
      keyword,
      cache,
      limiter,
      chunker,
      ocr,
      storage,
      config,
    }
  }

  pub fn storage(&self) -> &DocumentStorage {
    &self.storage
  }

  // ==========================================================================
  // Admission + upload
  // ==========================================================================

  fn admit(&self, request: &UploadRequest) -> Result<(), ServiceError> {
    let max = self.config.ingest.max_file_size;
    if request.bytes.len() as u64 > max {
      return Err(ServiceError::FileTooLarge {
        size: request.bytes.len() as u64,
        max,
      });
    }
    if !processor::is_supported(&request.file_type) {
      return Err(ServiceError::UnsupportedType(request.file_type.clone()));
    }
    Ok(())
  }

  /// Admit and persist an upload. The document is created `pending`; actual
  /// processing runs through the background job runner.
  pub async fn upload(&self, tenant: TenantId, request: UploadRequest) -> Result<Document, ServiceError> {
    self.limiter.check_upload(tenant).await?;
    self.admit(&request)?;

    let count = self.db.count_documents(tenant).await?;
    let cap = self.config.ingest.max_documents_per_user;
    if count >= cap {
      return Err(ServiceError::QuotaExceeded(format!(
        "maximum {cap} documents allowed, delete a document first"
      )));
    }

    self.db.get_or_create_space(tenant).await?;

    let file_name = canonical_file_name(&request.file_name);
    if self.db.get_document_by_name(tenant, &file_name).await?.is_some() {
      return Err(ServiceError::Conflict(file_name));
    }

    let mut document = Document::new(tenant, file_name.clone(), request.file_type.clone(), request.bytes.len() as u64);
    document.content_hash = Some(content_hash(&request.bytes));

    let path = self
      .storage
      .write_document(tenant, document.id, &file_name, &request.bytes)
      .await
      .map_err(|e| ServiceError::StoreWriteFailed(e.to_string()))?;
    document.file_path = path.to_string_lossy().replace('\\', "/");

    self.db.upsert_document(&document).await?;

    // Concurrent uploads of the same name race past the existence check;
    // the later row yields and reports a conflict.
    let racers = self.db.list_documents(tenant).await?;
    let mut same_name: Vec<&Document> = racers.iter().filter(|d| d.file_name == file_name).collect();
    if same_name.len() > 1 {
      same_name.sort_by(|a, b| a.id.to_string().cmp(&b.id.to_string()));
      if same_name[0].id != document.id {
        self.db.delete_document(&document.id.to_string()).await.ok();
        self.storage.delete_document_files(tenant, document.id, &file_name).await;
        return Err(ServiceError::Conflict(file_name));
      }
    }

    info!(
      doc_id = %document.id,
      file = %file_name,
      file_type = %request.file_type,
      size = request.bytes.len(),
      tenant = %tenant,
      "Upload admitted"
    );
    Ok(document)
  }

  /// Admit a batch atomically: one rejection fails the whole batch, nothing
  /// is persisted. On success each document is created pending with the
  /// batch id attached.
  pub async fn batch_upload(
    &self,
    tenant: TenantId,
    requests: Vec<UploadRequest>,
  ) -> Result<(Batch, Vec<Document>), ServiceError> {
    if requests.is_empty() {
      return Err(ServiceError::Internal("empty batch".to_string()));
    }

    // Admission for every file, including duplicates within the batch itself.
    let mut seen = std::collections::HashSet::new();
    for request in &requests {
      self.admit(request)?;
      let name = canonical_file_name(&request.file_name);
      if !seen.insert(name.clone()) {
        return Err(ServiceError::Conflict(name));
      }
      if self.db.get_document_by_name(tenant, &name).await?.is_some() {
        return Err(ServiceError::Conflict(name));
      }
    }

    let count = self.db.count_documents(tenant).await?;
    let cap = self.config.ingest.max_documents_per_user;
    if count + requests.len() > cap {
      return Err(ServiceError::QuotaExceeded(format!(
        "batch of {} would exceed the {cap}-document limit",
        requests.len()
      )));
    }

    self.db.get_or_create_space(tenant).await?;

    let mut batch = Batch::new(tenant, requests.len());
    batch.status = crate::domain::document::BatchStatus::Processing;
    self.db.upsert_batch(&batch).await?;

    let mut documents = Vec::with_capacity(requests.len());
    for request in requests {
      let file_name = canonical_file_name(&request.file_name);
      let mut document = Document::new(tenant, file_name.clone(), request.file_type.clone(), request.bytes.len() as u64);
      document.content_hash = Some(content_hash(&request.bytes));
      document.batch_id = Some(batch.id);

      let path = self
        .storage
        .write_document(tenant, document.id, &file_name, &request.bytes)
        .await
        .map_err(|e| ServiceError::StoreWriteFailed(e.to_string()))?;
      document.file_path = path.to_string_lossy().replace('\\', "/");

      self.db.upsert_document(&document).await?;
      documents.push(document);
    }

    info!(batch_id = %batch.id, total = batch.total, tenant = %tenant, "Batch admitted");
    Ok((batch, documents))
  }

  /// Advance a batch's counters after one child job finished.
  pub async fn record_batch_result(&self, tenant: TenantId, batch_id: &str, success: bool) -> Result<(), ServiceError> {
    let Some(mut batch) = self.db.get_batch(tenant, batch_id).await? else {
      return Err(ServiceError::not_found("batch", batch_id));
    };

    if success {
      batch.completed += 1;
    } else {
      batch.failed += 1;
    }
    batch.status = batch.derived_status();
    self.db.upsert_batch(&batch).await?;

    debug!(
      batch_id = %batch.id,
      completed = batch.completed,
      failed = batch.failed,
      status = batch.status.as_str(),
      "Batch progress"
    );
    Ok(())
  }

  // ==========================================================================
  // Create-then-process
  // ==========================================================================

  async fn set_stage(&self, document: &mut Document, stage: ProcessingStage, percent: u8) -> Result<(), ServiceError> {
    document.status = DocumentStatus::Processing;
    document.progress_stage = Some(stage);
    document.progress_percent = percent;
    document.updated_at = chrono::Utc::now();
    self.db.upsert_document(document).await?;
    Ok(())
  }

  async fn mark_failed(&self, document: &mut Document, error: &ServiceError) {
    document.status = DocumentStatus::Failed;
    document.progress_stage = None;
    document.progress_percent = 0;
    document.error_message = Some(error.to_string());
    document.updated_at = chrono::Utc::now();
    if let Err(e) = self.db.upsert_document(document).await {
      warn!(doc_id = %document.id, error = %e, "Failed to persist failure status");
    }
  }

  /// Run the full extract → clean → chunk → embed → index pipeline for a
  /// pending document. Errors set `status=failed` and propagate for the job
  /// runner's retry classification.
  pub async fn process(&self, tenant: TenantId, document_id: DocumentId) -> Result<(), ServiceError> {
    let Some(mut document) = self.db.get_document(tenant, &document_id.to_string()).await? else {
      return Err(ServiceError::not_found("document", document_id.to_string()));
    };

    info!(
      doc_id = %document.id,
      file = %document.file_name,
      file_type = %document.file_type,
      tenant = %tenant,
      "Processing document"
    );

    match self.process_inner(tenant, &mut document).await {
      Ok(chunk_count) => {
        info!(doc_id = %document.id, chunks = chunk_count, "Processing complete");
        Ok(())
      }
      Err(e) => {
        warn!(doc_id = %document.id, error = %e, "Processing failed");
        self.mark_failed(&mut document, &e).await;
        Err(e)
      }
    }
  }

  async fn process_inner(&self, tenant: TenantId, document: &mut Document) -> Result<usize, ServiceError> {
    self.set_stage(document, ProcessingStage::Extracting, 10).await?;
    let bytes = self
      .storage
      .read_document(std::path::Path::new(&document.file_path))
      .await
      .map_err(|e| ServiceError::ExtractionFailed(e.to_string()))?;

    let extraction = self.extract(&bytes, &document.file_type).await?;

    if let Some(language) = processor::detect_language(&extraction.text) {
      document.language = Some(language);
    }
    if !extraction.metadata.is_null() {
      document.extracted_metadata = merge_metadata(&document.extracted_metadata, &extraction.metadata);
    }

    self.set_stage(document, ProcessingStage::Cleaning, 20).await?;
    let space = self.db.get_or_create_space(tenant).await?;
    let rules = space.processing_rules.clone();
    let cleaned = self.clean(&extraction.text, rules.as_ref());

    self.set_stage(document, ProcessingStage::Chunking, 30).await?;
    let chunks = self.chunk(document, &cleaned, &extraction, rules.as_ref()).await?;
    self.chunker.validate_count(chunks.len()).map_err(ServiceError::from)?;
    self.set_stage(document, ProcessingStage::Chunking, 40).await?;

    self.set_stage(document, ProcessingStage::Embedding, 50).await?;
    let embeddings = self.embed_with_cache(tenant, &chunks).await?;
    self.set_stage(document, ProcessingStage::Embedding, 80).await?;

    if embeddings.len() != chunks.len() {
      return Err(ServiceError::Internal(format!(
        "embedding count {} != chunk count {}",
        embeddings.len(),
        chunks.len()
      )));
    }

    self.set_stage(document, ProcessingStage::Indexing, 85).await?;
    self.commit_chunks(tenant, document, &chunks, &embeddings).await?;

    document.status = DocumentStatus::Completed;
    document.chunk_count = chunks.len();
    document.progress_stage = None;
    document.progress_percent = 100;
    document.updated_at = chrono::Utc::now();
    if let Err(e) = self.db.upsert_document(document).await {
      // Vectors are live but the completion record failed: compensate so no
      // orphaned points survive.
      warn!(doc_id = %document.id, error = %e, "Document commit failed after vector write, compensating");
      self
        .vector
        .delete_points_by_document(tenant, &document.id.to_string())
        .await
        .ok();
      self.db.delete_chunks_by_document(&document.id.to_string()).await.ok();
      return Err(e.into());
    }

    // Both stores agree; bring the keyword index in sync.
    for chunk in &chunks {
      self.keyword.on_chunk_written(
        &chunk.id.to_string(),
        &chunk.text,
        tenant,
        &document.id.to_string(),
        Some(document.file_type.as_str()),
        document.category.as_deref(),
      );
    }

    let references = processor::extract_references(&extraction.text);
    if !references.is_empty() {
      debug!(doc_id = %document.id, references = references.len(), "References extracted");
    }

    Ok(chunks.len())
  }

  async fn extract(&self, bytes: &[u8], mime: &str) -> Result<Extraction, ServiceError> {
    if processor::requires_ocr(mime) {
      processor::validate_content(bytes, mime)?;
      let Some(ocr) = &self.ocr else {
        return Err(ServiceError::ExtractionFailed("no OCR backend configured".to_string()));
      };
      let result = ocr.ocr(bytes, mime).await?;
      if result.value.trim().is_empty() {
        return Err(ServiceError::ExtractionFailed("OCR produced no text".to_string()));
      }
      return Ok(Extraction {
        text: result.value,
        page_info: Vec::new(),
        metadata: serde_json::Value::Null,
      });
    }

    Ok(processor::extract(bytes, mime)?)
  }

  /// No configured rules ⇒ the automatic defaults (collapse whitespace,
  /// keep URLs). Explicitly disabled rules still go through the
  /// minimum-invariant pass inside the cleaner.
  fn clean(&self, text: &str, rules: Option<&ProcessingRules>) -> String {
    let clean_rules = match rules {
      None => CleanRules::default(),
      Some(r) => CleanRules {
        remove_extra_spaces: r.remove_extra_spaces,
        remove_urls_emails: r.remove_urls_emails,
      },
    };
    cleaner::clean(text, clean_rules)
  }

  async fn chunk(
    &self,
    document: &Document,
    cleaned: &str,
    extraction: &Extraction,
    rules: Option<&ProcessingRules>,
  ) -> Result<Vec<Chunk>, ServiceError> {
    let mode = rules.map(|r| r.mode).unwrap_or(SegmentationMode::Automatic);
    let custom_size = rules.and_then(|r| r.chunk_size);
    let output = self
      .chunker
      .chunk_text(document.id, cleaned, &extraction.page_info, mode, custom_size)
      .await?;

    if output.engine_fallback {
      warn!(
        doc_id = %document.id,
        mode = ?mode,
        "Chunking engine demoted to fast splitter for this mode"
      );
    }

    Ok(output.chunks)
  }

  /// Embed chunk texts, consulting the permanent cache first. The whole
  /// uncached batch is budget-checked before any call is made.
  async fn embed_with_cache(&self, tenant: TenantId, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, ServiceError> {
    let mut embeddings: Vec<Option<Vec<f32>>> = Vec::with_capacity(chunks.len());
    let mut uncached: Vec<String> = Vec::new();
    let mut uncached_indices: Vec<usize> = Vec::new();

    for (i, chunk) in chunks.iter().enumerate() {
      match self.cache.get_document_embedding(&chunk.text).await {
        Some(vector) => embeddings.push(Some(vector)),
        None => {
          embeddings.push(None);
          uncached.push(chunk.text.clone());
          uncached_indices.push(i);
        }
      }
    }

    if !uncached.is_empty() {
      let backend = self.cache.backend();
      let batch_size = backend.batch_size().max(1);
      let estimated_calls = uncached.len().div_ceil(batch_size) as u64;

      // Fail fast before any partial embedding: both the tenant budget and
      // the provider QPM window need headroom for the whole batch.
      if let Err(e) = self.limiter.try_consume_embedding(tenant, estimated_calls).await {
        return Err(ServiceError::RateLimited(format!(
          "embedding needs ~{estimated_calls} API calls ({} texts, batch size {batch_size}) but only {} remain this minute",
          uncached.len(),
          e.remaining
        )));
      }
      let provider_headroom = backend.remaining_qpm().await;
      if provider_headroom < estimated_calls as usize {
        return Err(ServiceError::RateLimited(format!(
          "provider QPM window has {provider_headroom} calls left, batch needs ~{estimated_calls}"
        )));
      }

      let vectors = backend.embed_batch(&uncached).await?;
      if vectors.len() != uncached.len() {
        return Err(ServiceError::Internal(format!(
          "expected {} embeddings, got {}",
          uncached.len(),
          vectors.len()
        )));
      }

      for (text, (index, vector)) in uncached.iter().zip(uncached_indices.into_iter().zip(vectors)) {
        self.cache.cache_document_embedding(text, &vector).await;
        embeddings[index] = Some(vector);
      }
    }

    Ok(embeddings.into_iter().map(|v| v.unwrap_or_default()).collect())
  }

  /// Write chunk rows, then vector points. Chunk rows are rolled back when
  /// the vector write fails so neither store holds a partial document.
  async fn commit_chunks(
    &self,
    tenant: TenantId,
    document: &Document,
    chunks: &[Chunk],
    embeddings: &[Vec<f32>],
  ) -> Result<(), ServiceError> {
    self.db.add_chunks(tenant, chunks).await?;

    let points: Vec<VectorPoint> = chunks
      .iter()
      .zip(embeddings.iter())
      .map(|(chunk, vector)| self.point_for(tenant, document, chunk, vector.clone()))
      .collect();

    if let Err(e) = self.vector.upsert_points(tenant, &points).await {
      warn!(doc_id = %document.id, error = %e, "Vector write failed, rolling back chunk rows");
      let ids: Vec<String> = chunks.iter().map(|c| c.id.to_string()).collect();
      self.db.delete_chunks_by_ids(&ids).await.ok();
      return Err(ServiceError::StoreWriteFailed(e.to_string()));
    }

    Ok(())
  }

  fn point_for(&self, tenant: TenantId, document: &Document, chunk: &Chunk, vector: Vec<f32>) -> VectorPoint {
    VectorPoint {
      chunk_id: chunk.id.to_string(),
      document_id: document.id.to_string(),
      tenant_id: tenant,
      document_type: Some(document.file_type.clone()),
      category: document.category.clone(),
      page_number: chunk.metadata.page_number,
      section_title: chunk.metadata.section_title.clone(),
      has_table: chunk.metadata.has_table,
      has_code: chunk.metadata.has_code,
      vector,
    }
  }

  // ==========================================================================
  // Update (partial reindex)
  // ==========================================================================

  /// Replace a document's bytes, reindexing only the chunks whose text hash
  /// changed. Identical content is a no-op. Returns the updated document.
  pub async fn update(
    &self,
    tenant: TenantId,
    document_id: DocumentId,
    bytes: Vec<u8>,
    new_file_name: Option<String>,
  ) -> Result<Document, ServiceError> {
    let Some(mut document) = self.db.get_document(tenant, &document_id.to_string()).await? else {
      return Err(ServiceError::not_found("document", document_id.to_string()));
    };

    let max = self.config.ingest.max_file_size;
    if bytes.len() as u64 > max {
      return Err(ServiceError::FileTooLarge {
        size: bytes.len() as u64,
        max,
      });
    }

    let new_hash = content_hash(&bytes);
    if document.content_hash.as_deref() == Some(new_hash.as_str()) {
      info!(doc_id = %document.id, "Content unchanged, skipping update");
      return Ok(document);
    }

    if let Some(detected) = processor::detect_type(&bytes)
      && detected != document.file_type
      && !(detected == processor::MIME_TEXT && document.file_type == processor::MIME_MARKDOWN)
    {
      warn!(
        doc_id = %document.id,
        old_type = %document.file_type,
        new_type = %detected,
        "File type changed during update, full reindex will run"
      );
      document.file_type = detected;
    }

    info!(doc_id = %document.id, tenant = %tenant, "Updating document");

    match self
      .update_inner(tenant, &mut document, bytes, new_file_name, new_hash)
      .await
    {
      Ok(document) => Ok(document),
      Err(e) => {
        self.mark_failed(&mut document, &e).await;
        Err(e)
      }
    }
  }

  async fn update_inner(
    &self,
    tenant: TenantId,
    document: &mut Document,
    bytes: Vec<u8>,
    new_file_name: Option<String>,
    new_hash: String,
  ) -> Result<Document, ServiceError> {
    self.set_stage(document, ProcessingStage::Updating, 0).await?;

    // Snapshot the prior bytes under the pre-update version number.
    // Best-effort: a failed snapshot does not block the update.
    let snapshot_version = document.version;
    let mut version_row: Option<DocumentVersion> = None;
    let current_path = std::path::PathBuf::from(&document.file_path);
    match self
      .storage
      .snapshot_version(tenant, document.id, snapshot_version, &document.file_name, &current_path)
      .await
    {
      Ok(snapshot_path) => {
        let row = DocumentVersion {
          document_id: document.id,
          version_number: snapshot_version,
          file_path: snapshot_path.to_string_lossy().replace('\\', "/"),
          file_hash: document.content_hash.clone().unwrap_or_default(),
          chunk_count: document.chunk_count,
          change_summary: None,
          created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.db.add_document_version(&row).await {
          warn!(doc_id = %document.id, error = %e, "Failed to record version row");
        } else {
          version_row = Some(row);
        }
      }
      Err(e) => warn!(doc_id = %document.id, error = %e, "Failed to snapshot prior version"),
    }

    if let Some(name) = new_file_name {
      document.file_name = canonical_file_name(&name);
    }
    document.file_size = bytes.len() as u64;
    document.version += 1;

    let path = self
      .storage
      .write_document(tenant, document.id, &document.file_name, &bytes)
      .await
      .map_err(|e| ServiceError::StoreWriteFailed(e.to_string()))?;
    document.file_path = path.to_string_lossy().replace('\\', "/");
    self.db.upsert_document(document).await?;

    let summary = self.reindex(tenant, document, &bytes, &new_hash).await?;

    if let Some(mut row) = version_row {
      row.change_summary = Some(summary);
      if let Err(e) = self.db.update_document_version(&row).await {
        warn!(doc_id = %document.id, error = %e, "Failed to store change summary");
      }
    }

    info!(
      doc_id = %document.id,
      version = document.version,
      added = summary.added,
      updated = summary.updated,
      deleted = summary.deleted,
      "Update complete"
    );
    Ok(document.clone())
  }

  /// Diff-based reindex: chunks are compared at identical `chunk_index` by
  /// text md5. Kept chunks are untouched, updated ones re-embed in place
  /// (same chunk id ⇒ same point id), extra prior indices are deleted and
  /// extra new indices are added.
  async fn reindex(
    &self,
    tenant: TenantId,
    document: &mut Document,
    bytes: &[u8],
    new_hash: &str,
  ) -> Result<ChangeSummary, ServiceError> {
    self.set_stage(document, ProcessingStage::Extracting, 10).await?;
    let extraction = self.extract(bytes, &document.file_type).await?;

    self.set_stage(document, ProcessingStage::Cleaning, 20).await?;
    let space = self.db.get_or_create_space(tenant).await?;
    let rules = space.processing_rules.clone();
    let cleaned = self.clean(&extraction.text, rules.as_ref());

    self.set_stage(document, ProcessingStage::Chunking, 30).await?;
    let new_chunks = self.chunk(document, &cleaned, &extraction, rules.as_ref()).await?;
    self.chunker.validate_count(new_chunks.len()).map_err(ServiceError::from)?;

    self.set_stage(document, ProcessingStage::Comparing, 40).await?;
    let existing = self.db.all_chunks(&document.id.to_string()).await?;
    let existing_by_index: std::collections::HashMap<usize, &Chunk> =
      existing.iter().map(|c| (c.chunk_index, c)).collect();

    let mut to_delete: std::collections::BTreeSet<usize> = existing_by_index.keys().copied().collect();
    let mut to_update: Vec<Chunk> = Vec::new();
    let mut to_add: Vec<Chunk> = Vec::new();

    for new_chunk in new_chunks.iter() {
      match existing_by_index.get(&new_chunk.chunk_index) {
        Some(old) => {
          to_delete.remove(&new_chunk.chunk_index);
          if old.text_hash() != new_chunk.text_hash() {
            // In-place update preserves the chunk id (and point id).
            let mut updated = new_chunk.clone();
            updated.id = old.id;
            to_update.push(updated);
          }
        }
        None => to_add.push(new_chunk.clone()),
      }
    }

    let summary = ChangeSummary {
      added: to_add.len(),
      updated: to_update.len(),
      deleted: to_delete.len(),
    };
    info!(
      doc_id = %document.id,
      added = summary.added,
      updated = summary.updated,
      deleted = summary.deleted,
      "Chunk comparison complete"
    );

    // Deleted set: vector points first, then chunk rows, then the index.
    if !to_delete.is_empty() {
      let delete_ids: Vec<String> = to_delete
        .iter()
        .filter_map(|i| existing_by_index.get(i))
        .map(|c| c.id.to_string())
        .collect();
      self
        .vector
        .delete_points_by_chunk_ids(tenant, &delete_ids)
        .await
        .map_err(|e| ServiceError::StoreWriteFailed(e.to_string()))?;
      self.db.delete_chunks_by_ids(&delete_ids).await?;
      for id in &delete_ids {
        self.keyword.on_chunk_deleted(id);
      }
    }

    if !to_update.is_empty() {
      self.set_stage(document, ProcessingStage::UpdatingChunks, 50).await?;
      let embeddings = self.embed_with_cache(tenant, &to_update).await?;

      for chunk in &to_update {
        self.db.update_chunk(tenant, chunk).await?;
      }
      let points: Vec<VectorPoint> = to_update
        .iter()
        .zip(embeddings.iter())
        .map(|(chunk, vector)| self.point_for(tenant, document, chunk, vector.clone()))
        .collect();
      self
        .vector
        .upsert_points(tenant, &points)
        .await
        .map_err(|e| ServiceError::StoreWriteFailed(e.to_string()))?;
      for chunk in &to_update {
        self.keyword.on_chunk_written(
          &chunk.id.to_string(),
          &chunk.text,
          tenant,
          &document.id.to_string(),
          Some(document.file_type.as_str()),
          document.category.as_deref(),
        );
      }
    }

    if !to_add.is_empty() {
      self.set_stage(document, ProcessingStage::AddingChunks, 70).await?;
      let embeddings = self.embed_with_cache(tenant, &to_add).await?;
      self.commit_chunks(tenant, document, &to_add, &embeddings).await?;
      for chunk in &to_add {
        self.keyword.on_chunk_written(
          &chunk.id.to_string(),
          &chunk.text,
          tenant,
          &document.id.to_string(),
          Some(document.file_type.as_str()),
          document.category.as_deref(),
        );
      }
    }

    document.status = DocumentStatus::Completed;
    document.chunk_count = new_chunks.len();
    document.content_hash = Some(new_hash.to_string());
    document.progress_stage = None;
    document.progress_percent = 100;
    document.updated_at = chrono::Utc::now();
    self.db.upsert_document(document).await?;

    Ok(summary)
  }

  // ==========================================================================
  // Rollback
  // ==========================================================================

  /// Restore a prior version's bytes and reindex against them. The current
  /// bytes are snapshotted first (best-effort) so rollbacks themselves can
  /// be rolled back; `version` keeps incrementing monotonically.
  pub async fn rollback(
    &self,
    tenant: TenantId,
    document_id: DocumentId,
    version_number: u32,
  ) -> Result<Document, ServiceError> {
    let Some(mut document) = self.db.get_document(tenant, &document_id.to_string()).await? else {
      return Err(ServiceError::not_found("document", document_id.to_string()));
    };
    let Some(version) = self
      .db
      .get_document_version(&document_id.to_string(), version_number)
      .await?
    else {
      return Err(ServiceError::not_found("version", format!("{document_id}/v{version_number}")));
    };

    let version_path = std::path::PathBuf::from(&version.file_path);
    if !version_path.exists() {
      return Err(ServiceError::not_found("version file", version.file_path.clone()));
    }

    info!(doc_id = %document.id, version = version_number, "Rolling back document");

    match self.rollback_inner(tenant, &mut document, &version, &version_path).await {
      Ok(document) => Ok(document),
      Err(e) => {
        self.mark_failed(&mut document, &e).await;
        Err(e)
      }
    }
  }

  async fn rollback_inner(
    &self,
    tenant: TenantId,
    document: &mut Document,
    version: &DocumentVersion,
    version_path: &std::path::Path,
  ) -> Result<Document, ServiceError> {
    self.set_stage(document, ProcessingStage::Rollback, 0).await?;

    // Snapshot the pre-rollback bytes so this rollback is reversible.
    let current_path = std::path::PathBuf::from(&document.file_path);
    match self
      .storage
      .snapshot_version(tenant, document.id, document.version, &document.file_name, &current_path)
      .await
    {
      Ok(snapshot_path) => {
        let row = DocumentVersion {
          document_id: document.id,
          version_number: document.version,
          file_path: snapshot_path.to_string_lossy().replace('\\', "/"),
          file_hash: document.content_hash.clone().unwrap_or_default(),
          chunk_count: document.chunk_count,
          change_summary: None,
          created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.db.add_document_version(&row).await {
          warn!(doc_id = %document.id, error = %e, "Failed to record pre-rollback version");
        }
      }
      Err(e) => warn!(doc_id = %document.id, error = %e, "Failed to snapshot pre-rollback bytes"),
    }

    self
      .storage
      .restore_version(version_path, &current_path)
      .await
      .map_err(|e| ServiceError::StoreWriteFailed(e.to_string()))?;

    document.version += 1;
    self.db.upsert_document(document).await?;

    let bytes = self
      .storage
      .read_document(&current_path)
      .await
      .map_err(|e| ServiceError::StoreWriteFailed(e.to_string()))?;
    let summary = self.reindex(tenant, document, &bytes, &version.file_hash).await?;

    info!(
      doc_id = %document.id,
      restored_version = version.version_number,
      new_version = document.version,
      updated = summary.updated,
      "Rollback complete"
    );
    Ok(document.clone())
  }

  // ==========================================================================
  // Delete
  // ==========================================================================

  /// Cascade-delete a document: vector points first (preserving the main
  /// invariant mid-delete), then chunks, versions, files, and the row.
  pub async fn delete(&self, tenant: TenantId, document_id: DocumentId) -> Result<(), ServiceError> {
    let Some(document) = self.db.get_document(tenant, &document_id.to_string()).await? else {
      return Err(ServiceError::not_found("document", document_id.to_string()));
    };

    let id = document_id.to_string();
    self
      .vector
      .delete_points_by_document(tenant, &id)
      .await
      .map_err(|e| ServiceError::StoreWriteFailed(e.to_string()))?;
    self.keyword.on_document_deleted(&id);
    self.db.delete_chunks_by_document(&id).await?;
    self.db.delete_document_versions(&id).await?;
    self
      .storage
      .delete_document_files(tenant, document_id, &document.file_name)
      .await;
    self.db.delete_document(&id).await?;

    info!(doc_id = %id, tenant = %tenant, "Document deleted");
    Ok(())
  }
}

fn merge_metadata(existing: &serde_json::Value, extracted: &serde_json::Value) -> serde_json::Value {
  match (existing, extracted) {
    (serde_json::Value::Object(a), serde_json::Value::Object(b)) => {
      let mut merged = a.clone();
      for (k, v) in b {
        merged.insert(k.clone(), v.clone());
      }
      serde_json::Value::Object(merged)
    }
    (serde_json::Value::Null, b) => b.clone(),
    (a, serde_json::Value::Null) => a.clone(),
    (_, b) => b.clone(),
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;
  use crate::{
    config::TenantLimitsConfig,
    limits::CounterStore,
    provider::{EmbeddingBackend, ProviderError, validation},
  };

  const DIM: usize = 8;

  /// Deterministic embedding backend: vector derived from the text's md5.
  struct StubEmbedder;

  #[async_trait::async_trait]
  impl EmbeddingBackend for StubEmbedder {
    fn provider_name(&self) -> &str {
      "stub"
    }

    fn model_id(&self) -> &str {
      "stub-embedding"
    }

    fn dimensions(&self) -> usize {
      DIM
    }

    fn batch_size(&self) -> usize {
      10
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
      Ok(
        texts
          .iter()
          .map(|t| {
            let digest = md5::compute(t.as_bytes());
            let mut v: Vec<f32> = digest.0[..DIM].iter().map(|&b| b as f32 + 1.0).collect();
            validation::l2_normalize(&mut v);
            v
          })
          .collect(),
      )
    }
  }

  struct Fixture {
    _temp: TempDir,
    orchestrator: Orchestrator,
    db: Arc<KbDb>,
    vector: Arc<VectorStore>,
  }

  async fn fixture() -> Fixture {
    fixture_with_limits(TenantLimitsConfig::default()).await
  }

  async fn fixture_with_limits(limits: TenantLimitsConfig) -> Fixture {
    let temp = TempDir::new().unwrap();

    let mut config = Config::default();
    config.embedding.dimensions = DIM;
    config.ingest.storage_dir = temp.path().join("storage");
    config.limits = limits;

    let db = Arc::new(
      KbDb::open_at_path(temp.path().join("test.lancedb"), DIM)
        .await
        .unwrap(),
    );
    let vector = Arc::new(VectorStore::new(Arc::clone(&db), config.vector.clone()));
    let keyword = Arc::new(KeywordIndex::new(Arc::clone(&db)));
    let cache = Arc::new(EmbeddingCache::new(
      Arc::clone(&db),
      Arc::new(StubEmbedder),
      &config.embedding,
    ));
    let limiter = Arc::new(TenantLimiter::new(
      Arc::new(CounterStore::local_only()),
      config.limits.clone(),
    ));
    let chunker = Arc::new(Chunker::from_config(&config.chunking, None));

    let orchestrator = Orchestrator::new(
      Arc::clone(&db),
      Arc::clone(&vector),
      keyword,
      cache,
      limiter,
      chunker,
      None,
      Arc::new(config),
    );

    Fixture {
      _temp: temp,
      orchestrator,
      db,
      vector,
    }
  }

  fn upload(name: &str, text: &str) -> UploadRequest {
    UploadRequest {
      file_name: name.to_string(),
      file_type: "text/plain".to_string(),
      bytes: text.as_bytes().to_vec(),
    }
  }

  const TENANT: TenantId = TenantId(1);

  #[tokio::test]
  async fn test_upload_and_process_completes() {
    let f = fixture().await;

    let doc = f
      .orchestrator
      .upload(TENANT, upload("bio.txt", "Photosynthesis converts light into chemical energy. Chlorophyll absorbs light."))
      .await
      .unwrap();
    assert_eq!(doc.status, DocumentStatus::Pending);

    f.orchestrator.process(TENANT, doc.id).await.unwrap();

    let processed = f.db.get_document(TENANT, &doc.id.to_string()).await.unwrap().unwrap();
    assert_eq!(processed.status, DocumentStatus::Completed);
    assert_eq!(processed.progress_percent, 100);
    assert!(processed.chunk_count > 0);
    assert_eq!(processed.language.as_deref(), Some("en"));

    // Invariant: point count equals chunk count for the completed document.
    let points = f.vector.points_count(TENANT).await.unwrap();
    assert_eq!(points, processed.chunk_count);
  }

  #[tokio::test]
  async fn test_quota_enforced() {
    let f = fixture().await;
    for i in 0..5 {
      f.orchestrator
        .upload(TENANT, upload(&format!("doc{i}.txt"), "content here"))
        .await
        .unwrap();
    }

    let err = f
      .orchestrator
      .upload(TENANT, upload("one-too-many.txt", "content"))
      .await
      .unwrap_err();
    assert!(matches!(err, ServiceError::QuotaExceeded(_)));
  }

  #[tokio::test]
  async fn test_duplicate_name_conflicts() {
    let f = fixture().await;
    f.orchestrator.upload(TENANT, upload("same.txt", "a")).await.unwrap();

    let err = f.orchestrator.upload(TENANT, upload("same.txt", "b")).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
  }

  #[tokio::test]
  async fn test_oversized_upload_rejected() {
    let f = fixture().await;
    let huge = UploadRequest {
      file_name: "big.txt".to_string(),
      file_type: "text/plain".to_string(),
      bytes: vec![b'a'; 11 * 1024 * 1024],
    };
    let err = f.orchestrator.upload(TENANT, huge).await.unwrap_err();
    assert!(matches!(err, ServiceError::FileTooLarge { .. }));
  }

  #[tokio::test]
  async fn test_unsupported_type_rejected() {
    let f = fixture().await;
    let request = UploadRequest {
      file_name: "archive.rar".to_string(),
      file_type: "application/x-rar".to_string(),
      bytes: b"Rar!".to_vec(),
    };
    let err = f.orchestrator.upload(TENANT, request).await.unwrap_err();
    assert!(matches!(err, ServiceError::UnsupportedType(_)));
  }

  #[tokio::test]
  async fn test_update_identical_bytes_is_noop() {
    let f = fixture().await;
    let text = "Stable content that does not change.";
    let doc = f.orchestrator.upload(TENANT, upload("stable.txt", text)).await.unwrap();
    f.orchestrator.process(TENANT, doc.id).await.unwrap();

    let updated = f
      .orchestrator
      .update(TENANT, doc.id, text.as_bytes().to_vec(), None)
      .await
      .unwrap();
    assert_eq!(updated.version, 1, "identical bytes must not bump the version");

    let versions = f.db.list_document_versions(&doc.id.to_string()).await.unwrap();
    assert!(versions.is_empty());
  }

  #[tokio::test]
  async fn test_partial_reindex_counts_and_point_parity() {
    let f = fixture().await;
    let original = "First paragraph stays identical.\n\nSecond paragraph will change soon.";
    let doc = f.orchestrator.upload(TENANT, upload("doc.txt", original)).await.unwrap();
    f.orchestrator.process(TENANT, doc.id).await.unwrap();

    let before = f.db.get_document(TENANT, &doc.id.to_string()).await.unwrap().unwrap();

    let modified = "First paragraph stays identical.\n\nSecond paragraph is now different text.";
    let updated = f
      .orchestrator
      .update(TENANT, doc.id, modified.as_bytes().to_vec(), None)
      .await
      .unwrap();

    assert_eq!(updated.version, 2);
    assert_eq!(updated.status, DocumentStatus::Completed);

    // Change summary recorded on the snapshot version row.
    let versions = f.db.list_document_versions(&doc.id.to_string()).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version_number, 1);
    let summary = versions[0].change_summary.unwrap();
    assert!(summary.added + summary.updated + summary.deleted > 0);
    assert_eq!(summary.deleted, 0);

    // Point parity holds after the partial reindex.
    let after = f.db.get_document(TENANT, &doc.id.to_string()).await.unwrap().unwrap();
    assert_eq!(f.vector.points_count(TENANT).await.unwrap(), after.chunk_count);
    assert_eq!(before.chunk_count, after.chunk_count);
  }

  #[tokio::test]
  async fn test_rollback_restores_original_text() {
    let f = fixture().await;
    let original = "Original wording of the document.";
    let doc = f.orchestrator.upload(TENANT, upload("roll.txt", original)).await.unwrap();
    f.orchestrator.process(TENANT, doc.id).await.unwrap();

    f.orchestrator
      .update(TENANT, doc.id, b"Replacement wording of the document.".to_vec(), None)
      .await
      .unwrap();

    let rolled = f.orchestrator.rollback(TENANT, doc.id, 1).await.unwrap();
    assert_eq!(rolled.version, 3);

    let chunks = f.db.all_chunks(&doc.id.to_string()).await.unwrap();
    let text: String = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(text, original);
  }

  #[tokio::test]
  async fn test_embedding_budget_fails_fast_with_no_partial_state() {
    let f = fixture_with_limits(TenantLimitsConfig {
      kb_embedding_rpm: 0,
      ..Default::default()
    })
    .await;

    let doc = f
      .orchestrator
      .upload(TENANT, upload("limited.txt", "Text that will need embedding calls."))
      .await
      .unwrap();

    let err = f.orchestrator.process(TENANT, doc.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::RateLimited(_)));
    assert!(err.to_string().contains("remain"), "message names remaining budget");

    // No partial vectors or chunks survive the fast failure.
    assert_eq!(f.vector.points_count(TENANT).await.unwrap(), 0);
    assert_eq!(f.db.count_chunks(TENANT).await.unwrap(), 0);

    let failed = f.db.get_document(TENANT, &doc.id.to_string()).await.unwrap().unwrap();
    assert_eq!(failed.status, DocumentStatus::Failed);
    assert!(failed.error_message.is_some());
  }

  #[tokio::test]
  async fn test_delete_cascades() {
    let f = fixture().await;
    let doc = f
      .orchestrator
      .upload(TENANT, upload("gone.txt", "Content to be deleted entirely."))
      .await
      .unwrap();
    f.orchestrator.process(TENANT, doc.id).await.unwrap();

    f.orchestrator.delete(TENANT, doc.id).await.unwrap();

    assert!(f.db.get_document(TENANT, &doc.id.to_string()).await.unwrap().is_none());
    assert_eq!(f.db.count_chunks(TENANT).await.unwrap(), 0);
    assert_eq!(f.vector.points_count(TENANT).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_batch_admission_is_atomic() {
    let f = fixture().await;

    // Second file repeats the first name: the whole batch is rejected.
    let err = f
      .orchestrator
      .batch_upload(TENANT, vec![upload("a.txt", "one"), upload("a.txt", "two")])
      .await
      .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
    assert_eq!(f.db.count_documents(TENANT).await.unwrap(), 0);

    let (batch, documents) = f
      .orchestrator
      .batch_upload(TENANT, vec![upload("a.txt", "one"), upload("b.txt", "two")])
      .await
      .unwrap();
    assert_eq!(batch.total, 2);
    assert_eq!(documents.len(), 2);
    assert!(documents.iter().all(|d| d.batch_id == Some(batch.id)));
  }

  #[tokio::test]
  async fn test_batch_progress_tracking() {
    let f = fixture().await;
    let (batch, _docs) = f
      .orchestrator
      .batch_upload(TENANT, vec![upload("x.txt", "one"), upload("y.txt", "two")])
      .await
      .unwrap();

    f.orchestrator
      .record_batch_result(TENANT, &batch.id.to_string(), true)
      .await
      .unwrap();
    f.orchestrator
      .record_batch_result(TENANT, &batch.id.to_string(), false)
      .await
      .unwrap();

    let finished = f.db.get_batch(TENANT, &batch.id.to_string()).await.unwrap().unwrap();
    assert_eq!(finished.completed, 1);
    assert_eq!(finished.failed, 1);
    // Partial success still counts as completed, with failed_count > 0.
    assert_eq!(finished.status, crate::domain::document::BatchStatus::Completed);
  }
}
