use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tenant::TenantId;

/// Unique identifier for a document (newtype for type safety)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(Uuid);

impl DocumentId {
  pub fn new() -> Self {
    Self(Uuid::now_v7()) // Time-ordered UUIDs
  }

  pub fn as_uuid(&self) -> Uuid {
    self.0
  }
}

impl Default for DocumentId {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Display for DocumentId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl std::str::FromStr for DocumentId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(Self(Uuid::parse_str(s)?))
  }
}

/// Unique identifier for a chunk. Doubles as the vector point id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkId(Uuid);

impl ChunkId {
  pub fn new() -> Self {
    Self(Uuid::now_v7())
  }

  pub fn as_uuid(&self) -> Uuid {
    self.0
  }
}

impl Default for ChunkId {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Display for ChunkId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl std::str::FromStr for ChunkId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(Self(Uuid::parse_str(s)?))
  }
}

/// Unique identifier for a batch of co-submitted documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(Uuid);

impl BatchId {
  pub fn new() -> Self {
    Self(Uuid::now_v7())
  }
}

impl Default for BatchId {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Display for BatchId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl std::str::FromStr for BatchId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(Self(Uuid::parse_str(s)?))
  }
}

// ============================================================================
// Document lifecycle
// ============================================================================

/// Document processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
  #[default]
  Pending,
  Processing,
  Completed,
  Failed,
}

impl DocumentStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Processing => "processing",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }
}

impl std::str::FromStr for DocumentStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "processing" => Ok(Self::Processing),
      "completed" => Ok(Self::Completed),
      "failed" => Ok(Self::Failed),
      other => Err(format!("unknown document status: {other}")),
    }
  }
}

/// Sub-stage of the `processing` status, shown to the UI alongside a percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
  Extracting,
  Cleaning,
  Chunking,
  Embedding,
  Indexing,
  Updating,
  Comparing,
  AddingChunks,
  UpdatingChunks,
  Rollback,
}

impl ProcessingStage {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Extracting => "extracting",
      Self::Cleaning => "cleaning",
      Self::Chunking => "chunking",
      Self::Embedding => "embedding",
      Self::Indexing => "indexing",
      Self::Updating => "updating",
      Self::Comparing => "comparing",
      Self::AddingChunks => "adding_chunks",
      Self::UpdatingChunks => "updating_chunks",
      Self::Rollback => "rollback",
    }
  }
}

impl std::str::FromStr for ProcessingStage {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "extracting" => Ok(Self::Extracting),
      "cleaning" => Ok(Self::Cleaning),
      "chunking" => Ok(Self::Chunking),
      "embedding" => Ok(Self::Embedding),
      "indexing" => Ok(Self::Indexing),
      "updating" => Ok(Self::Updating),
      "comparing" => Ok(Self::Comparing),
      "adding_chunks" => Ok(Self::AddingChunks),
      "updating_chunks" => Ok(Self::UpdatingChunks),
      "rollback" => Ok(Self::Rollback),
      other => Err(format!("unknown processing stage: {other}")),
    }
  }
}

/// A tenant-owned document. Mutated only by the ingestion orchestrator;
/// deleting it cascades to its chunks and vector points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
  pub id: DocumentId,
  pub tenant_id: TenantId,

  /// Original filename, unique within the space
  pub file_name: String,
  /// Canonical storage path (forward-slash form)
  pub file_path: String,
  /// Claimed and validated MIME type
  pub file_type: String,
  pub file_size: u64,

  pub status: DocumentStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub progress_stage: Option<ProcessingStage>,
  /// 0..=100
  pub progress_percent: u8,

  pub chunk_count: usize,
  /// md5 of the current file bytes
  #[serde(skip_serializing_if = "Option::is_none")]
  pub content_hash: Option<String>,
  /// Monotonic; bumped on every update and rollback
  pub version: u32,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub language: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  pub tags: Vec<String>,
  /// Title/author/creation-date etc. pulled from the file itself
  pub extracted_metadata: serde_json::Value,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub error_message: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub batch_id: Option<BatchId>,

  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Document {
  pub fn new(tenant_id: TenantId, file_name: String, file_type: String, file_size: u64) -> Self {
    let now = Utc::now();
    Self {
      id: DocumentId::new(),
      tenant_id,
      file_name,
      file_path: String::new(),
      file_type,
      file_size,
      status: DocumentStatus::Pending,
      progress_stage: None,
      progress_percent: 0,
      chunk_count: 0,
      content_hash: None,
      version: 1,
      language: None,
      category: None,
      tags: Vec::new(),
      extracted_metadata: serde_json::Value::Null,
      error_message: None,
      batch_id: None,
      created_at: now,
      updated_at: now,
    }
  }
}

// ============================================================================
// Chunks
// ============================================================================

/// Structural metadata carried on every chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkMetadata {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub page_number: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub section_title: Option<String>,
  pub token_count: usize,
  pub has_table: bool,
  pub has_code: bool,
}

/// A contiguous span of cleaned document text, the unit of vector indexing.
///
/// Invariants: `start_char <= end_char`, `chunk_index` is dense and 0-based
/// within its document, and a vector point with `point_id == id` exists iff
/// the owning document is `completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
  pub id: ChunkId,
  pub document_id: DocumentId,
  pub chunk_index: usize,
  pub text: String,
  pub start_char: usize,
  pub end_char: usize,
  pub metadata: ChunkMetadata,
}

impl Chunk {
  /// md5 of the chunk text, the identity used by partial-reindex diffing.
  pub fn text_hash(&self) -> String {
    format!("{:x}", md5::compute(self.text.as_bytes()))
  }
}

// ============================================================================
// Versions
// ============================================================================

/// Chunk-level change counts produced by a partial reindex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
  pub added: usize,
  pub updated: usize,
  pub deleted: usize,
}

impl ChangeSummary {
  pub fn is_noop(&self) -> bool {
    self.added == 0 && self.updated == 0 && self.deleted == 0
  }
}

/// Snapshot of a document's bytes taken before an update, enabling rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentVersion {
  pub document_id: DocumentId,
  pub version_number: u32,
  /// Path of the snapshotted bytes under `versions/<doc_id>/`
  pub file_path: String,
  /// md5 of the snapshotted bytes
  pub file_hash: String,
  pub chunk_count: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub change_summary: Option<ChangeSummary>,
  pub created_at: DateTime<Utc>,
}

// ============================================================================
// Batches
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
  #[default]
  Pending,
  Processing,
  Completed,
  Failed,
}

impl BatchStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Processing => "processing",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }
}

impl std::str::FromStr for BatchStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "processing" => Ok(Self::Processing),
      "completed" => Ok(Self::Completed),
      "failed" => Ok(Self::Failed),
      other => Err(format!("unknown batch status: {other}")),
    }
  }
}

/// A group of documents uploaded together. Counters advance as the child
/// jobs finish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
  pub id: BatchId,
  pub tenant_id: TenantId,
  pub total: usize,
  pub completed: usize,
  pub failed: usize,
  pub status: BatchStatus,
  pub created_at: DateTime<Utc>,
}

impl Batch {
  pub fn new(tenant_id: TenantId, total: usize) -> Self {
    Self {
      id: BatchId::new(),
      tenant_id,
      total,
      completed: 0,
      failed: 0,
      status: BatchStatus::Pending,
      created_at: Utc::now(),
    }
  }

  /// Derive the batch status from its counters.
  ///
  /// `completed` iff all jobs finished and at least one succeeded;
  /// `failed` iff every job failed.
  pub fn derived_status(&self) -> BatchStatus {
    if self.completed + self.failed < self.total {
      BatchStatus::Processing
    } else if self.failed == self.total && self.total > 0 {
      BatchStatus::Failed
    } else {
      BatchStatus::Completed
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_batch_status_derivation() {
    let mut batch = Batch::new(TenantId(1), 3);
    assert_eq!(batch.derived_status(), BatchStatus::Processing);

    batch.completed = 2;
    batch.failed = 1;
    assert_eq!(batch.derived_status(), BatchStatus::Completed);

    batch.completed = 0;
    batch.failed = 3;
    assert_eq!(batch.derived_status(), BatchStatus::Failed);

    batch.completed = 3;
    batch.failed = 0;
    assert_eq!(batch.derived_status(), BatchStatus::Completed);
  }

  #[test]
  fn test_chunk_text_hash_is_md5() {
    let chunk = Chunk {
      id: ChunkId::new(),
      document_id: DocumentId::new(),
      chunk_index: 0,
      text: "hello".to_string(),
      start_char: 0,
      end_char: 5,
      metadata: ChunkMetadata::default(),
    };
    assert_eq!(chunk.text_hash(), "5d41402abc4b2a76b9719d911017c592");
  }

  #[test]
  fn test_document_status_round_trip() {
    for status in [
      DocumentStatus::Pending,
      DocumentStatus::Processing,
      DocumentStatus::Completed,
      DocumentStatus::Failed,
    ] {
      assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
    }
  }
}
