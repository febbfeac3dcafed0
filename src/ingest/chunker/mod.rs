//! Pluggable chunking engines.
//!
//! Two engines are available: a fast local token-aware splitter and an
//! LLM-driven semantic splitter. Hierarchical and custom segmentation modes
//! always run on the fast engine regardless of configuration; when that
//! demotion happens with the LLM engine configured, the output carries an
//! `engine_fallback` flag that callers surface as a warning.

mod llm;
mod semantic;

use std::sync::Arc;

pub use llm::LlmChunker;
pub use semantic::SemanticChunker;
use tracing::{debug, warn};

use crate::{
  config::{ChunkingConfig, ChunkingEngine},
  domain::{
    document::{Chunk, DocumentId},
    tenant::SegmentationMode,
  },
  ingest::processor::PageInfo,
  provider::ChatBackend,
};

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
  #[error("chunking produced no chunks for non-empty text")]
  Empty,
  #[error("chunk count {count} exceeds the per-tenant cap of {cap}")]
  CountExceeded { count: usize, cap: usize },
  #[error("LLM boundary proposal failed: {0}")]
  Llm(String),
}

/// Result of chunking one document's cleaned text.
#[derive(Debug, Clone)]
pub struct ChunkerOutput {
  pub chunks: Vec<Chunk>,
  /// True when the configured engine was demoted to the fast engine
  /// because of an unsupported segmentation mode.
  pub engine_fallback: bool,
}

/// The configured chunking engine plus sizing rules.
pub struct Chunker {
  engine: Engine,
  config: ChunkingConfig,
}

enum Engine {
  Fast(SemanticChunker),
  Llm(LlmChunker),
}

impl Chunker {
  /// Build the chunker selected by configuration. The LLM engine needs a
  /// chat backend; without one the fast engine is used.
  pub fn from_config(config: &ChunkingConfig, chat: Option<Arc<dyn ChatBackend>>) -> Self {
    let chunk_size = config.validated_chunk_size();
    let engine = match (config.engine, chat) {
      (ChunkingEngine::Mindchunk, Some(chat)) => {
        debug!(chunk_size, "Chunker initialized with LLM engine");
        Engine::Llm(LlmChunker::new(chat, SemanticChunker::new(chunk_size)))
      }
      (ChunkingEngine::Mindchunk, None) => {
        warn!("LLM chunking engine configured but no chat backend available, using fast engine");
        Engine::Fast(SemanticChunker::new(chunk_size))
      }
      (ChunkingEngine::Semchunk, _) => Engine::Fast(SemanticChunker::new(chunk_size)),
    };

    Self {
      engine,
      config: config.clone(),
    }
  }

  /// Split cleaned text into chunks.
  ///
  /// Chunks are contiguous, non-overlapping spans covering the full text, so
  /// concatenating them reproduces the input. Zero chunks on non-empty text
  /// degrade to a single whole-text chunk.
  pub async fn chunk_text(
    &self,
    document_id: DocumentId,
    text: &str,
    page_info: &[PageInfo],
    mode: SegmentationMode,
    custom_size: Option<usize>,
  ) -> Result<ChunkerOutput, ChunkError> {
    if text.trim().is_empty() {
      return Err(ChunkError::Empty);
    }

    // Hierarchical and custom modes always run on the fast engine.
    let (chunks, engine_fallback) = match (&self.engine, mode) {
      (Engine::Fast(fast), _) => {
        let fast = self.resized(fast, mode, custom_size);
        (fast.chunk(document_id, text, page_info), false)
      }
      (Engine::Llm(llm), SegmentationMode::Automatic) => (llm.chunk(document_id, text, page_info).await?, false),
      (Engine::Llm(llm), demoted_mode) => {
        warn!(
          mode = ?demoted_mode,
          "Segmentation mode not supported by the LLM engine, falling back to fast chunking"
        );
        let fast = self.resized(llm.fast(), demoted_mode, custom_size);
        (fast.chunk(document_id, text, page_info), true)
      }
    };

    let chunks = if chunks.is_empty() {
      // Trivially short text still yields one chunk.
      vec![SemanticChunker::whole_text_chunk(document_id, text)]
    } else {
      chunks
    };

    debug!(
      document_id = %document_id,
      chunks = chunks.len(),
      chars = text.len(),
      engine_fallback,
      "Chunking complete"
    );

    Ok(ChunkerOutput { chunks, engine_fallback })
  }

  /// Apply a custom chunk size (custom mode only) to a copy of the fast engine.
  fn resized(&self, fast: &SemanticChunker, mode: SegmentationMode, custom_size: Option<usize>) -> SemanticChunker {
    match (mode, custom_size) {
      (SegmentationMode::Custom, Some(size)) => {
        let validated = if size < 50 || size > self.config.max_segmentation_tokens {
          warn!(size, "Custom chunk size out of range, using default 500");
          500
        } else {
          size
        };
        SemanticChunker::new(validated)
      }
      _ => fast.clone(),
    }
  }

  /// Predicted chunk count for a text length, used by admission before any
  /// embedding call is made.
  pub fn estimate_count(&self, text_len: usize) -> usize {
    let chunk_size = self.config.validated_chunk_size();
    let char_size = chunk_size * crate::config::CHARS_PER_TOKEN;
    let char_overlap = self.config.chunk_overlap * crate::config::CHARS_PER_TOKEN;
    let effective = char_size.saturating_sub(char_overlap);
    if effective == 0 {
      return 1;
    }
    text_len.div_ceil(effective).max(1)
  }

  /// Enforce the per-tenant chunk cap.
  pub fn validate_count(&self, count: usize) -> Result<(), ChunkError> {
    let cap = self.config.max_chunks_per_user;
    if count > cap {
      return Err(ChunkError::CountExceeded { count, cap });
    }
    Ok(())
  }
}
