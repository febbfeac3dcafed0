//! Fast local token-aware splitter.
//!
//! Splits at the strongest boundary that fits the token budget: paragraph
//! breaks first, then sentence ends (Latin and CJK punctuation), then
//! whitespace, then a hard character cut. Chunks are contiguous and
//! non-overlapping so their concatenation reproduces the input text.

use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

use crate::{
  config::CHARS_PER_TOKEN,
  domain::document::{Chunk, ChunkId, ChunkMetadata, DocumentId},
  ingest::processor::{PageInfo, page_for_offset},
};

static TOKENIZER: Lazy<CoreBPE> = Lazy::new(|| tiktoken_rs::cl100k_base().expect("embedded cl100k_base tokenizer"));

/// Counts tokens with the cl100k_base encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCounter;

impl TokenCounter {
  pub fn count(&self, text: &str) -> usize {
    TOKENIZER.encode_ordinary(text).len()
  }
}

/// Sentence-ending punctuation, Latin and CJK.
const SENTENCE_ENDS: &[char] = &['.', '!', '?', ';', '。', '！', '？', '；'];

#[derive(Debug, Clone)]
pub struct SemanticChunker {
  chunk_size: usize,
  counter: TokenCounter,
}

impl SemanticChunker {
  pub fn new(chunk_size: usize) -> Self {
    Self {
      chunk_size,
      counter: TokenCounter,
    }
  }

  /// Split text into chunks with dense 0-based indices and char offsets.
  pub fn chunk(&self, document_id: DocumentId, text: &str, page_info: &[PageInfo]) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
      return Vec::new();
    }

    let spans = self.split_spans(&chars);

    spans
      .into_iter()
      .enumerate()
      .map(|(index, (start, end))| {
        let chunk_text: String = chars[start..end].iter().collect();
        self.build_chunk(document_id, index, chunk_text, start, end, page_info)
      })
      .collect()
  }

  /// Single chunk covering the entire text; used when a document is shorter
  /// than any boundary, or as the degradation path for an empty LLM proposal.
  pub fn whole_text_chunk(document_id: DocumentId, text: &str) -> Chunk {
    let counter = TokenCounter;
    Chunk {
      id: ChunkId::new(),
      document_id,
      chunk_index: 0,
      text: text.to_string(),
      start_char: 0,
      end_char: text.chars().count(),
      metadata: ChunkMetadata {
        token_count: counter.count(text),
        has_table: text_has_table(text),
        has_code: text_has_code(text),
        ..Default::default()
      },
    }
  }

  fn build_chunk(
    &self,
    document_id: DocumentId,
    index: usize,
    text: String,
    start: usize,
    end: usize,
    page_info: &[PageInfo],
  ) -> Chunk {
    let token_count = self.counter.count(&text);
    Chunk {
      id: ChunkId::new(),
      document_id,
      chunk_index: index,
      start_char: start,
      end_char: end,
      metadata: ChunkMetadata {
        page_number: page_for_offset(page_info, start),
        section_title: None,
        token_count,
        has_table: text_has_table(&text),
        has_code: text_has_code(&text),
      },
      text,
    }
  }

  /// Greedy span computation over the char array.
  fn split_spans(&self, chars: &[char]) -> Vec<(usize, usize)> {
    let len = chars.len();
    let window = self.chunk_size * CHARS_PER_TOKEN;
    let mut spans = Vec::new();
    let mut start = 0usize;

    while start < len {
      let mut end = (start + window).min(len);
      if end < len {
        end = find_break(chars, start, end);
      }

      // Refine until the span fits the token budget.
      loop {
        let slice: String = chars[start..end].iter().collect();
        let tokens = self.counter.count(&slice);
        if tokens <= self.chunk_size || end - start <= 1 {
          break;
        }
        let target = ((end - start) * self.chunk_size / tokens).max(1);
        let mut new_end = start + target;
        if new_end < len {
          new_end = find_break(chars, start, new_end);
        }
        if new_end >= end {
          new_end = (start + target).min(end - 1);
        }
        end = new_end.max(start + 1);
      }

      spans.push((start, end));
      start = end;
    }

    spans
  }
}

/// Find the best split position in `(start, limit]`, preferring paragraph
/// breaks, then sentence ends, then whitespace. Breaks in the first half of
/// the window are skipped to avoid degenerate slivers.
fn find_break(chars: &[char], start: usize, limit: usize) -> usize {
  let floor = start + (limit - start) / 2;

  // Paragraph: position just after "\n\n"
  let mut i = limit;
  while i > floor + 1 {
    if chars[i - 1] == '\n' && chars[i - 2] == '\n' {
      return i;
    }
    i -= 1;
  }

  // Sentence end: position just after terminal punctuation
  let mut i = limit;
  while i > floor {
    if SENTENCE_ENDS.contains(&chars[i - 1]) {
      return i;
    }
    i -= 1;
  }

  // Whitespace
  let mut i = limit;
  while i > floor {
    if chars[i - 1].is_whitespace() {
      return i;
    }
    i -= 1;
  }

  limit
}

fn text_has_table(text: &str) -> bool {
  text.contains("|---") || text.lines().filter(|l| l.trim_start().starts_with('|')).count() >= 2
}

fn text_has_code(text: &str) -> bool {
  text.contains("```")
}
