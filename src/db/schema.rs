use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema};

/// Schema for the knowledge_spaces table (at most one row per tenant)
pub fn spaces_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("tenant_id", DataType::UInt64, false),
    Field::new("processing_rules", DataType::Utf8, true), // JSON object
    Field::new("created_at", DataType::Int64, false),
  ]))
}

/// Schema for the documents table
pub fn documents_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("tenant_id", DataType::UInt64, false),
    Field::new("file_name", DataType::Utf8, false),
    Field::new("file_path", DataType::Utf8, false),
    Field::new("file_type", DataType::Utf8, false),
    Field::new("file_size", DataType::UInt64, false),
    Field::new("status", DataType::Utf8, false),
    Field::new("progress_stage", DataType::Utf8, true),
    Field::new("progress_percent", DataType::UInt32, false),
    Field::new("chunk_count", DataType::UInt32, false),
    Field::new("content_hash", DataType::Utf8, true),
    Field::new("version", DataType::UInt32, false),
    Field::new("language", DataType::Utf8, true),
    Field::new("category", DataType::Utf8, true),
    Field::new("tags", DataType::Utf8, false),               // JSON array
    Field::new("extracted_metadata", DataType::Utf8, false), // JSON object
    Field::new("error_message", DataType::Utf8, true),
    Field::new("batch_id", DataType::Utf8, true),
    Field::new("created_at", DataType::Int64, false), // Unix timestamp ms
    Field::new("updated_at", DataType::Int64, false),
  ]))
}

/// Schema for the chunks table (text and metadata; vectors live in the
/// per-tenant collections)
pub fn chunks_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("document_id", DataType::Utf8, false),
    Field::new("tenant_id", DataType::UInt64, false),
    Field::new("chunk_index", DataType::UInt32, false),
    Field::new("text", DataType::Utf8, false),
    Field::new("start_char", DataType::UInt64, false),
    Field::new("end_char", DataType::UInt64, false),
    Field::new("metadata", DataType::Utf8, false), // JSON object
    Field::new("created_at", DataType::Int64, false),
  ]))
}

/// Schema for the document_versions table
pub fn document_versions_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("document_id", DataType::Utf8, false),
    Field::new("version_number", DataType::UInt32, false),
    Field::new("file_path", DataType::Utf8, false),
    Field::new("file_hash", DataType::Utf8, false),
    Field::new("chunk_count", DataType::UInt32, false),
    Field::new("change_summary", DataType::Utf8, true), // JSON object
    Field::new("created_at", DataType::Int64, false),
  ]))
}

/// Schema for the batches table
pub fn batches_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("tenant_id", DataType::UInt64, false),
    Field::new("total", DataType::UInt32, false),
    Field::new("completed", DataType::UInt32, false),
    Field::new("failed", DataType::UInt32, false),
    Field::new("status", DataType::Utf8, false),
    Field::new("created_at", DataType::Int64, false),
  ]))
}

/// Schema for the permanent document-embedding cache
pub fn embedding_cache_schema(vector_dim: usize) -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false), // "<model>:<provider>:<text_hash>"
    Field::new("model_name", DataType::Utf8, false),
    Field::new("provider_name", DataType::Utf8, false),
    Field::new("text_hash", DataType::Utf8, false),
    Field::new(
      "vector",
      DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), vector_dim as i32),
      false,
    ),
    Field::new("created_at", DataType::Int64, false),
  ]))
}

/// Schema for recorded retrieval queries
pub fn query_records_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("tenant_id", DataType::UInt64, false),
    Field::new("query", DataType::Utf8, false),
    Field::new("method", DataType::Utf8, false),
    Field::new("top_k", DataType::UInt32, false),
    Field::new("score_threshold", DataType::Float32, false),
    Field::new("result_count", DataType::UInt32, false),
    Field::new("embedding_ms", DataType::Float64, false),
    Field::new("search_ms", DataType::Float64, false),
    Field::new("rerank_ms", DataType::Float64, false),
    Field::new("total_ms", DataType::Float64, false),
    Field::new("source", DataType::Utf8, false),
    Field::new("created_at", DataType::Int64, false),
  ]))
}

/// Schema for per-query feedback
pub fn feedback_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("query_id", DataType::Utf8, false),
    Field::new("tenant_id", DataType::UInt64, false),
    Field::new("kind", DataType::Utf8, false),
    Field::new("score", DataType::UInt32, true), // 1..=5
    Field::new("relevant_chunk_ids", DataType::Utf8, false), // JSON array
    Field::new("irrelevant_chunk_ids", DataType::Utf8, false), // JSON array
    Field::new("created_at", DataType::Int64, false),
  ]))
}

/// Schema for streamed-chat usage accounting
pub fn usage_records_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("tenant_id", DataType::UInt64, false),
    Field::new("organization_id", DataType::Utf8, true),
    Field::new("conversation_id", DataType::Utf8, true),
    Field::new("endpoint", DataType::Utf8, false),
    Field::new("model_alias", DataType::Utf8, false),
    Field::new("input_tokens", DataType::UInt64, false),
    Field::new("output_tokens", DataType::UInt64, false),
    Field::new("total_tokens", DataType::UInt64, false),
    Field::new("response_time_ms", DataType::Float64, false),
    Field::new("success", DataType::Boolean, false),
    Field::new("created_at", DataType::Int64, false),
  ]))
}

/// Schema for evaluation datasets (queries stored as JSON)
pub fn evaluation_datasets_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("tenant_id", DataType::UInt64, false),
    Field::new("name", DataType::Utf8, false),
    Field::new("queries", DataType::Utf8, false), // JSON array
    Field::new("created_at", DataType::Int64, false),
  ]))
}

/// Schema for a per-tenant vector collection. `id` is the chunk id; the
/// payload columns support filtered search and drift diagnostics.
pub fn points_schema(vector_dim: usize) -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("document_id", DataType::Utf8, false),
    Field::new("tenant_id", DataType::UInt64, false),
    Field::new("document_type", DataType::Utf8, true),
    Field::new("category", DataType::Utf8, true),
    Field::new("page_number", DataType::UInt32, true),
    Field::new("section_title", DataType::Utf8, true),
    Field::new("has_table", DataType::Boolean, false),
    Field::new("has_code", DataType::Boolean, false),
    Field::new(
      "vector",
      DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), vector_dim as i32),
      false,
    ),
  ]))
}
