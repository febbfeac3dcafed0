//! Sparse retrieval over chunk text.
//!
//! The primary backend is the in-process BM25 index, kept in sync with the
//! chunks table through the hooks below and backfilled on startup when its
//! count falls behind. When the index is disabled the fallback is a
//! tokenized substring scan over the chunks table at a constant 0.5 score.

mod bm25;

use std::sync::Arc;

pub use bm25::{Bm25Index, KeywordFilter, tokenize};
use tracing::{info, warn};

use crate::{
  db::{KbDb, Result},
  domain::tenant::TenantId,
};

enum Backend {
  Bm25(Bm25Index),
  Substring,
}

pub struct KeywordIndex {
  backend: Backend,
  db: Arc<KbDb>,
}

impl KeywordIndex {
  /// Full-text backend (default).
  pub fn new(db: Arc<KbDb>) -> Self {
    Self {
      backend: Backend::Bm25(Bm25Index::new()),
      db,
    }
  }

  /// Substring-scan fallback backend.
  pub fn substring_fallback(db: Arc<KbDb>) -> Self {
    warn!("Keyword index running in substring-fallback mode");
    Self {
      backend: Backend::Substring,
      db,
    }
  }

  /// Backfill the index from the chunks table. Compares counts first and
  /// only indexes rows not yet present.
  pub async fn backfill(&self) -> Result<usize> {
    let Backend::Bm25(index) = &self.backend else {
      return Ok(0);
    };

    let total = self.db.count_all_chunks().await?;
    let indexed = index.indexed_count();
    if indexed >= total {
      return Ok(0);
    }

    info!(indexed, total, "Backfilling keyword index");
    let mut added = 0usize;
    for stored in self.db.all_stored_chunks().await? {
      let chunk_id = stored.chunk.id.to_string();
      if index.contains(&chunk_id) {
        continue;
      }
      index.index_chunk(
        &chunk_id,
        &stored.chunk.text,
        stored.tenant_id,
        &stored.chunk.document_id.to_string(),
        None,
        None,
      );
      added += 1;
    }

    info!(added, "Keyword index backfill complete");
    Ok(added)
  }

  /// Hook: a chunk row was written. Mirrors the trigger the relational
  /// rendition would install on the chunks table.
  pub fn on_chunk_written(
    &self,
    chunk_id: &str,
    text: &str,
    tenant: TenantId,
    document_id: &str,
    document_type: Option<&str>,
    category: Option<&str>,
  ) {
    if let Backend::Bm25(index) = &self.backend {
      index.index_chunk(chunk_id, text, tenant, document_id, document_type, category);
    }
  }

  /// Hook: a chunk row was deleted.
  pub fn on_chunk_deleted(&self, chunk_id: &str) {
    if let Backend::Bm25(index) = &self.backend {
      index.remove_chunk(chunk_id);
    }
  }

  /// Hook: a document and all its chunks were deleted.
  pub fn on_document_deleted(&self, document_id: &str) {
    if let Backend::Bm25(index) = &self.backend {
      index.remove_document(document_id);
    }
  }

  /// Keyword search for one tenant. Best-first `(chunk_id, score)`.
  pub async fn search(
    &self,
    tenant: TenantId,
    query: &str,
    k: usize,
    filter: &KeywordFilter,
  ) -> Result<Vec<(String, f32)>> {
    match &self.backend {
      Backend::Bm25(index) => Ok(index.search(tenant, query, k, filter)),
      Backend::Substring => self.substring_search(tenant, query, k, filter).await,
    }
  }

  /// Fallback: tokenized substring match over the chunks table, constant
  /// 0.5 score.
  async fn substring_search(
    &self,
    tenant: TenantId,
    query: &str,
    k: usize,
    filter: &KeywordFilter,
  ) -> Result<Vec<(String, f32)>> {
    let terms = tokenize(query);
    if terms.is_empty() {
      return Ok(Vec::new());
    }

    let mut hits = Vec::new();
    for stored in self.db.all_stored_chunks().await? {
      if stored.tenant_id != tenant {
        continue;
      }
      if let Some(document_id) = &filter.document_id
        && &stored.chunk.document_id.to_string() != document_id
      {
        continue;
      }

      let haystack = stored.chunk.text.to_lowercase();
      if terms.iter().any(|t| haystack.contains(t.as_str())) {
        hits.push((stored.chunk.id.to_string(), 0.5));
        if hits.len() >= k {
          break;
        }
      }
    }

    Ok(hits)
  }
}
