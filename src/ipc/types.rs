//! IPC request and response payloads, one variant per exposed operation.

use serde::{Deserialize, Serialize};

use crate::{
  config::RetrievalMethod,
  domain::{
    document::{Batch, Chunk, Document, DocumentVersion},
    query::QueryRecord,
  },
  retrieval::{EvaluationReport, RetrievalResponse},
  stream::{StreamFile, StreamRequest},
  vector::CompressionMetrics,
};

/// One file in a batch upload. Content travels base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFilePayload {
  pub file_name: String,
  pub file_type: String,
  pub content_base64: String,
}

#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum RequestData {
  // --- documents ---
  UploadDocument {
    file_name: String,
    file_type: String,
    content_base64: String,
  },
  BatchUploadDocuments {
    files: Vec<UploadFilePayload>,
  },
  GetBatch {
    batch_id: String,
  },
  ListDocuments,
  GetDocument {
    document_id: String,
  },
  UpdateDocument {
    document_id: String,
    file_name: Option<String>,
    content_base64: String,
  },
  DeleteDocument {
    document_id: String,
  },
  GetDocumentStatus {
    document_id: String,
  },
  GetDocumentChunks {
    document_id: String,
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
  },
  RollbackDocument {
    document_id: String,
    version_number: u32,
  },
  ListDocumentVersions {
    document_id: String,
  },
  UpdateDocumentMetadata {
    document_id: String,
    category: Option<String>,
    tags: Option<Vec<String>>,
  },

  // --- retrieval ---
  RetrievalTest {
    query: String,
    method: Option<RetrievalMethod>,
    top_k: Option<usize>,
    score_threshold: Option<f32>,
  },
  RetrievalHistory,
  SubmitFeedback {
    query_id: String,
    kind: String,
    score: Option<u8>,
    #[serde(default)]
    relevant_chunk_ids: Vec<String>,
    #[serde(default)]
    irrelevant_chunk_ids: Vec<String>,
  },

  // --- evaluation ---
  CreateEvaluationDataset {
    name: String,
    queries: serde_json::Value,
  },
  ListEvaluationDatasets,
  RunEvaluation {
    dataset_id: String,
    method: Option<RetrievalMethod>,
  },

  // --- observability ---
  CompressionMetrics,
  VectorDiagnostics,

  // --- diagram generation ---
  GenerateGraph {
    prompt: String,
    model_alias: Option<String>,
  },

  // --- streaming chat ---
  StreamChat {
    message: String,
    user_id: String,
    conversation_id: Option<String>,
    files: Option<Vec<StreamFile>>,
    inputs: Option<serde_json::Value>,
  },

  Ping,
}

fn default_page() -> usize {
  1
}

fn default_page_size() -> usize {
  20
}

impl RequestData {
  /// Convert a stream-chat request into the forwarder's input.
  pub fn as_stream_request(&self) -> Option<StreamRequest> {
    match self {
      Self::StreamChat {
        message,
        user_id,
        conversation_id,
        files,
        inputs,
      } => Some(StreamRequest {
        message: message.clone(),
        user_id: user_id.clone(),
        conversation_id: conversation_id.clone(),
        files: files.clone(),
        inputs: inputs.clone(),
      }),
      _ => None,
    }
  }
}

/// Progress snapshot for the status endpoint.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStatusPayload {
  pub document_id: String,
  pub status: String,
  pub progress_stage: Option<String>,
  pub progress_percent: u8,
  pub chunk_count: usize,
  pub version: u32,
  pub error_message: Option<String>,
}

impl From<&Document> for DocumentStatusPayload {
  fn from(doc: &Document) -> Self {
    Self {
      document_id: doc.id.to_string(),
      status: doc.status.as_str().to_string(),
      progress_stage: doc.progress_stage.map(|s| s.as_str().to_string()),
      progress_percent: doc.progress_percent,
      chunk_count: doc.chunk_count,
      version: doc.version,
      error_message: doc.error_message.clone(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPage {
  pub chunks: Vec<Chunk>,
  pub page: usize,
  pub page_size: usize,
  pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "payload")]
pub enum ResponseData {
  Document(Box<Document>),
  Documents(Vec<Document>),
  Batch(Batch),
  Status(DocumentStatusPayload),
  Chunks(ChunkPage),
  Versions(Vec<DocumentVersion>),
  Retrieval(Box<RetrievalResponse>),
  History(Vec<QueryRecord>),
  Evaluation(Box<EvaluationReport>),
  Datasets(Vec<serde_json::Value>),
  Compression(CompressionMetrics),
  Diagnostics(serde_json::Value),
  Generated(GeneratedContent),
  Ack,
  Pong,
}

/// A non-streaming chat completion (diagram generation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedContent {
  pub content: String,
  pub model_alias: String,
  pub input_tokens: u64,
  pub output_tokens: u64,
  pub total_tokens: u64,
  pub elapsed_ms: f64,
}
