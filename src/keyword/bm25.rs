//! In-process BM25 inverted index over chunk text.
//!
//! The index is kept in sync with the chunks table by explicit hooks on
//! every chunk write and delete, and backfilled at startup when its document
//! count falls behind the table's. k1/b use the standard defaults.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::domain::tenant::TenantId;

const K1: f64 = 1.2;
const B: f64 = 0.75;

/// Per-chunk entry carrying the payload needed for filtered search.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
  pub tenant_id: TenantId,
  pub document_id: String,
  pub document_type: Option<String>,
  pub category: Option<String>,
  /// Token count of the indexed text
  length: usize,
}

#[derive(Debug, Default)]
struct IndexState {
  /// chunk_id -> entry
  entries: HashMap<String, IndexedChunk>,
  /// term -> chunk_id -> term frequency
  postings: HashMap<String, HashMap<String, u32>>,
  /// Sum of entry lengths, for the average-length normalizer
  total_length: usize,
}

/// Filter applied during keyword search.
#[derive(Debug, Clone, Default)]
pub struct KeywordFilter {
  pub document_id: Option<String>,
  pub document_type: Option<String>,
  pub category: Option<String>,
}

impl KeywordFilter {
  fn matches(&self, entry: &IndexedChunk) -> bool {
    if let Some(id) = &self.document_id
      && &entry.document_id != id
    {
      return false;
    }
    if let Some(t) = &self.document_type
      && entry.document_type.as_ref() != Some(t)
    {
      return false;
    }
    if let Some(c) = &self.category
      && entry.category.as_ref() != Some(c)
    {
      return false;
    }
    true
  }
}

#[derive(Debug, Default)]
pub struct Bm25Index {
  state: RwLock<IndexState>,
}

impl Bm25Index {
  pub fn new() -> Self {
    Self::default()
  }

  /// Index (or re-index) one chunk's text.
  pub fn index_chunk(
    &self,
    chunk_id: &str,
    text: &str,
    tenant_id: TenantId,
    document_id: &str,
    document_type: Option<&str>,
    category: Option<&str>,
  ) {
    let terms = tokenize(text);
    let mut state = self.state.write().expect("bm25 index poisoned");

    remove_locked(&mut state, chunk_id);

    let length = terms.len();
    let mut frequencies: HashMap<String, u32> = HashMap::new();
    for term in terms {
      *frequencies.entry(term).or_insert(0) += 1;
    }
    for (term, tf) in frequencies {
      state.postings.entry(term).or_default().insert(chunk_id.to_string(), tf);
    }

    state.total_length += length;
    state.entries.insert(
      chunk_id.to_string(),
      IndexedChunk {
        tenant_id,
        document_id: document_id.to_string(),
        document_type: document_type.map(String::from),
        category: category.map(String::from),
        length,
      },
    );
  }

  /// Remove one chunk from the index.
  pub fn remove_chunk(&self, chunk_id: &str) {
    let mut state = self.state.write().expect("bm25 index poisoned");
    remove_locked(&mut state, chunk_id);
  }

  /// Remove every chunk of a document.
  pub fn remove_document(&self, document_id: &str) {
    let mut state = self.state.write().expect("bm25 index poisoned");
    let ids: Vec<String> = state
      .entries
      .iter()
      .filter(|(_, e)| e.document_id == document_id)
      .map(|(id, _)| id.clone())
      .collect();
    for id in ids {
      remove_locked(&mut state, &id);
    }
  }

  /// Number of indexed chunks (compared against the chunks table for
  /// startup backfill).
  pub fn indexed_count(&self) -> usize {
    self.state.read().expect("bm25 index poisoned").entries.len()
  }

  /// Whether a chunk is already indexed.
  pub fn contains(&self, chunk_id: &str) -> bool {
    self.state.read().expect("bm25 index poisoned").entries.contains_key(chunk_id)
  }

  /// BM25 search within one tenant's chunks.
  ///
  /// Results are best-first; the reported score maps the lower-is-better
  /// BM25 convention through `1/(1+|bm25|)`.
  pub fn search(&self, tenant: TenantId, query: &str, k: usize, filter: &KeywordFilter) -> Vec<(String, f32)> {
    let terms = tokenize(query);
    if terms.is_empty() {
      return Vec::new();
    }

    let state = self.state.read().expect("bm25 index poisoned");
    let n = state.entries.len();
    if n == 0 {
      return Vec::new();
    }
    let average_length = (state.total_length as f64 / n as f64).max(1.0);

    let mut scores: HashMap<&str, f64> = HashMap::new();
    for term in &terms {
      let Some(posting) = state.postings.get(term) else { continue };
      let df = posting.len();
      let idf = (1.0 + (n as f64 - df as f64 + 0.5) / (df as f64 + 0.5)).ln();

      for (chunk_id, &tf) in posting {
        let Some(entry) = state.entries.get(chunk_id) else { continue };
        if entry.tenant_id != tenant || !filter.matches(entry) {
          continue;
        }

        let tf = tf as f64;
        let normalizer = tf + K1 * (1.0 - B + B * entry.length as f64 / average_length);
        *scores.entry(chunk_id.as_str()).or_insert(0.0) += idf * tf * (K1 + 1.0) / normalizer;
      }
    }

    let mut ranked: Vec<(String, f64)> = scores.into_iter().map(|(id, s)| (id.to_string(), s)).collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(k);

    ranked
      .into_iter()
      .map(|(id, bm25)| (id, (1.0 / (1.0 + bm25.abs())) as f32))
      .collect()
  }
}

fn remove_locked(state: &mut IndexState, chunk_id: &str) {
  let Some(entry) = state.entries.remove(chunk_id) else {
    return;
  };
  state.total_length = state.total_length.saturating_sub(entry.length);

  state.postings.retain(|_, posting| {
    posting.remove(chunk_id);
    !posting.is_empty()
  });
}

/// Tokenize text for indexing and querying.
///
/// Latin/numeric words are lowercased; CJK runs are indexed as single chars
/// plus bigrams so multi-character terms still match.
pub fn tokenize(text: &str) -> Vec<String> {
  let mut terms = Vec::new();
  let mut word = String::new();
  let mut previous_cjk: Option<char> = None;

  for c in text.chars() {
    if is_cjk(c) {
      if !word.is_empty() {
        terms.push(std::mem::take(&mut word));
      }
      terms.push(c.to_string());
      if let Some(prev) = previous_cjk {
        terms.push(format!("{prev}{c}"));
      }
      previous_cjk = Some(c);
    } else if c.is_alphanumeric() {
      word.extend(c.to_lowercase());
      previous_cjk = None;
    } else {
      if !word.is_empty() {
        terms.push(std::mem::take(&mut word));
      }
      previous_cjk = None;
    }
  }
  if !word.is_empty() {
    terms.push(word);
  }

  terms
}

fn is_cjk(c: char) -> bool {
  ('\u{4E00}'..='\u{9FFF}').contains(&c) || ('\u{3400}'..='\u{4DBF}').contains(&c)
}
