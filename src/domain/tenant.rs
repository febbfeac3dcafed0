use serde::{Deserialize, Serialize};

/// Tenant (user) identifier: the isolation key for knowledge spaces,
/// vector collections, rate-limit counters and storage paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub u64);

impl TenantId {
  pub fn as_u64(&self) -> u64 {
    self.0
  }

  /// Vector collection name for this tenant, e.g. `user_42`.
  pub fn collection_name(&self, prefix: &str) -> String {
    format!("{}{}", prefix, self.0)
  }
}

impl std::fmt::Display for TenantId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<u64> for TenantId {
  fn from(v: u64) -> Self {
    Self(v)
  }
}

/// A tenant's knowledge space. At most one space exists per tenant; it owns
/// the tenant's documents and their processing rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSpace {
  pub tenant_id: TenantId,
  /// Optional processing-rule overrides applied during ingestion
  #[serde(skip_serializing_if = "Option::is_none")]
  pub processing_rules: Option<ProcessingRules>,
  pub created_at: chrono::DateTime<chrono::Utc>,
}

impl KnowledgeSpace {
  pub fn new(tenant_id: TenantId) -> Self {
    Self {
      tenant_id,
      processing_rules: None,
      created_at: chrono::Utc::now(),
    }
  }
}

/// Per-space processing rules, mirroring the upload pre-processing options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingRules {
  /// Segmentation mode: automatic (default), custom, hierarchical
  pub mode: SegmentationMode,
  /// Collapse runs of whitespace during cleaning
  pub remove_extra_spaces: bool,
  /// Strip raw URLs and emails (markdown links are preserved)
  pub remove_urls_emails: bool,
  /// Custom tokens-per-chunk (custom mode only)
  #[serde(skip_serializing_if = "Option::is_none")]
  pub chunk_size: Option<usize>,
  /// Custom overlap tokens (custom mode only)
  #[serde(skip_serializing_if = "Option::is_none")]
  pub chunk_overlap: Option<usize>,
}

/// How a document is segmented into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SegmentationMode {
  #[default]
  Automatic,
  Custom,
  Hierarchical,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_collection_name() {
    let tenant = TenantId(42);
    assert_eq!(tenant.collection_name("user_"), "user_42");
  }
}
