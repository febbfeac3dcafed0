//! LLM-driven semantic chunking.
//!
//! The model proposes boundary offsets over a sampled prefix of the text;
//! the boundary cadence is then extrapolated across the remainder with the
//! fast splitter. Only the `general` (automatic) structure uses this engine.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{ChunkError, semantic::SemanticChunker};
use crate::{
  domain::document::{Chunk, DocumentId},
  ingest::processor::PageInfo,
  provider::{ChatBackend, ChatMessage, ModelAlias},
};

/// Characters of text sampled for the boundary proposal.
const SAMPLE_CHARS: usize = 12_000;

/// Boundary-proposal prompt. The model returns a JSON array of character
/// offsets that start new semantic sections.
const BOUNDARY_PROMPT: &str = "You segment documents into semantically coherent sections. \
Given the text below, return ONLY a JSON array of character offsets (integers, ascending, \
exclusive of 0) where new sections should begin. Prefer topic shifts and heading boundaries. \
Aim for sections of roughly 1500-2500 characters.";

pub struct LlmChunker {
  chat: Arc<dyn ChatBackend>,
  fast: SemanticChunker,
}

impl LlmChunker {
  pub fn new(chat: Arc<dyn ChatBackend>, fast: SemanticChunker) -> Self {
    Self { chat, fast }
  }

  /// The fast engine used for demoted modes and extrapolation.
  pub fn fast(&self) -> &SemanticChunker {
    &self.fast
  }

  /// Chunk text by asking the model for boundaries over a sampled prefix.
  ///
  /// A failed or unparseable proposal degrades to the fast engine rather
  /// than failing the document.
  pub async fn chunk(
    &self,
    document_id: DocumentId,
    text: &str,
    page_info: &[PageInfo],
  ) -> Result<Vec<Chunk>, ChunkError> {
    let chars: Vec<char> = text.chars().collect();
    let sample_len = chars.len().min(SAMPLE_CHARS);
    let sample: String = chars[..sample_len].iter().collect();

    let boundaries = match self.propose_boundaries(&sample).await {
      Ok(b) if !b.is_empty() => b,
      Ok(_) => {
        debug!(document_id = %document_id, "LLM proposed no boundaries, using fast splitter");
        return Ok(self.fast.chunk(document_id, text, page_info));
      }
      Err(e) => {
        warn!(document_id = %document_id, error = %e, "LLM boundary proposal failed, using fast splitter");
        return Ok(self.fast.chunk(document_id, text, page_info));
      }
    };

    let spans = self.spans_from_boundaries(&chars, sample_len, &boundaries);

    let mut chunks = Vec::with_capacity(spans.len());
    for (start, end) in spans {
      let chunk_text: String = chars[start..end].iter().collect();
      // Delegate per-span metadata to the fast splitter's single-chunk path
      // so token counts and flags are computed identically.
      let mut chunk = SemanticChunker::whole_text_chunk(document_id, &chunk_text);
      chunk.chunk_index = chunks.len();
      chunk.start_char = start;
      chunk.end_char = end;
      chunk.metadata.page_number = crate::ingest::processor::page_for_offset(page_info, start);
      chunks.push(chunk);
    }

    Ok(chunks)
  }

  /// Ask the chat model for boundary offsets within the sample.
  async fn propose_boundaries(&self, sample: &str) -> Result<Vec<usize>, ChunkError> {
    let messages = vec![
      ChatMessage::system(BOUNDARY_PROMPT),
      ChatMessage::user(sample.to_string()),
    ];

    let response = self
      .chat
      .chat(ModelAlias::Qwen, messages)
      .await
      .map_err(|e| ChunkError::Llm(e.to_string()))?;

    parse_boundaries(&response.value, sample.chars().count())
  }

  /// Turn sampled boundaries into full-text spans.
  ///
  /// Boundaries cover the sampled prefix exactly; past the sample the average
  /// boundary gap is extended until the text ends.
  fn spans_from_boundaries(&self, chars: &[char], sample_len: usize, boundaries: &[usize]) -> Vec<(usize, usize)> {
    let len = chars.len();
    let mut cuts: Vec<usize> = boundaries.iter().copied().filter(|&b| b > 0 && b < sample_len).collect();
    cuts.sort_unstable();
    cuts.dedup();

    // Extrapolate the cadence beyond the sample.
    if sample_len < len {
      let average_gap = if cuts.is_empty() {
        sample_len.max(1)
      } else {
        (sample_len / (cuts.len() + 1)).max(200)
      };
      let mut next = cuts.last().copied().unwrap_or(0) + average_gap;
      while next < len {
        cuts.push(next);
        next += average_gap;
      }
    }

    let mut spans = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0usize;
    for cut in cuts {
      if cut > start && cut < len {
        spans.push((start, cut));
        start = cut;
      }
    }
    if start < len {
      spans.push((start, len));
    }
    spans
  }
}

/// Parse the model's JSON boundary array, tolerating surrounding prose.
fn parse_boundaries(response: &str, max: usize) -> Result<Vec<usize>, ChunkError> {
  let start = response.find('[');
  let end = response.rfind(']');
  let (Some(start), Some(end)) = (start, end) else {
    return Err(ChunkError::Llm("no JSON array in boundary response".to_string()));
  };
  if end <= start {
    return Err(ChunkError::Llm("malformed boundary response".to_string()));
  }

  let parsed: Vec<serde_json::Value> =
    serde_json::from_str(&response[start..=end]).map_err(|e| ChunkError::Llm(e.to_string()))?;

  let mut boundaries: Vec<usize> = parsed
    .into_iter()
    .filter_map(|v| v.as_u64())
    .map(|v| v as usize)
    .filter(|&b| b > 0 && b < max)
    .collect();
  boundaries.sort_unstable();
  boundaries.dedup();
  Ok(boundaries)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::provider::{Metered, ProviderError, Usage};

  struct ScriptedChat {
    response: String,
  }

  #[async_trait::async_trait]
  impl ChatBackend for ScriptedChat {
    async fn chat(&self, _alias: ModelAlias, _messages: Vec<ChatMessage>) -> Result<Metered<String>, ProviderError> {
      Ok(Metered {
        value: self.response.clone(),
        usage: Usage::default(),
        elapsed: std::time::Duration::from_millis(1),
      })
    }
  }

  fn chunker_with(response: &str) -> LlmChunker {
    LlmChunker::new(
      Arc::new(ScriptedChat {
        response: response.to_string(),
      }),
      SemanticChunker::new(500),
    )
  }

  #[tokio::test]
  async fn test_boundaries_produce_covering_spans() {
    let text = "abcdefghij".repeat(10); // 100 chars
    let chunker = chunker_with("[30, 60]");

    let chunks = chunker.chunk(DocumentId::new(), &text, &[]).await.unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].start_char, 0);
    assert_eq!(chunks[0].end_char, 30);
    assert_eq!(chunks[2].end_char, 100);

    let concatenated: String = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(concatenated, text);
  }

  #[tokio::test]
  async fn test_prose_wrapped_json_tolerated() {
    let text = "x".repeat(100);
    let chunker = chunker_with("Here are the boundaries: [50] as requested.");

    let chunks = chunker.chunk(DocumentId::new(), &text, &[]).await.unwrap();
    assert_eq!(chunks.len(), 2);
  }

  #[tokio::test]
  async fn test_garbage_response_falls_back_to_fast() {
    let text = "sentence one. sentence two. ".repeat(10);
    let chunker = chunker_with("I cannot do that");

    let chunks = chunker.chunk(DocumentId::new(), &text, &[]).await.unwrap();
    assert!(!chunks.is_empty());
    let concatenated: String = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(concatenated, text);
  }

  #[test]
  fn test_parse_boundaries_filters_out_of_range() {
    let boundaries = parse_boundaries("[0, 10, 20, 9999]", 100).unwrap();
    assert_eq!(boundaries, vec![10, 20]);
  }
}
