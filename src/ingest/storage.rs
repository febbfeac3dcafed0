//! Canonical file layout for document bytes and version snapshots.
//!
//! ```text
//! storage/<tenant>/<doc_id>_<filename>               current bytes
//! storage/<tenant>/versions/<doc_id>/v<n>_<filename> prior versions
//! ```

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::domain::{document::DocumentId, tenant::TenantId};

/// Filenames are stored in canonical forward-slash form; only the final
/// path segment survives, so a crafted name cannot escape the tenant dir.
pub fn canonical_file_name(raw: &str) -> String {
  let normalized = raw.replace('\\', "/");
  normalized
    .rsplit('/')
    .next()
    .filter(|s| !s.is_empty())
    .unwrap_or("unnamed")
    .to_string()
}

#[derive(Debug, Clone)]
pub struct DocumentStorage {
  root: PathBuf,
}

impl DocumentStorage {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn tenant_dir(&self, tenant: TenantId) -> PathBuf {
    self.root.join(tenant.to_string())
  }

  /// Canonical path of a document's current bytes.
  pub fn document_path(&self, tenant: TenantId, id: DocumentId, file_name: &str) -> PathBuf {
    self.tenant_dir(tenant).join(format!("{id}_{file_name}"))
  }

  /// Path of one version snapshot.
  pub fn version_path(&self, tenant: TenantId, id: DocumentId, version: u32, file_name: &str) -> PathBuf {
    self
      .tenant_dir(tenant)
      .join("versions")
      .join(id.to_string())
      .join(format!("v{version}_{file_name}"))
  }

  /// Write a document's canonical bytes.
  pub async fn write_document(&self, tenant: TenantId, id: DocumentId, file_name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let path = self.document_path(tenant, id, file_name);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }
    fs::write(&path, bytes).await?;
    debug!(path = %path.display(), size = bytes.len(), "Document bytes written");
    Ok(path)
  }

  pub async fn read_document(&self, path: &Path) -> std::io::Result<Vec<u8>> {
    fs::read(path).await
  }

  /// Snapshot the current bytes as version `n`.
  pub async fn snapshot_version(
    &self,
    tenant: TenantId,
    id: DocumentId,
    version: u32,
    file_name: &str,
    current_path: &Path,
  ) -> std::io::Result<PathBuf> {
    let path = self.version_path(tenant, id, version, file_name);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }
    fs::copy(current_path, &path).await?;
    debug!(path = %path.display(), version, "Version snapshot written");
    Ok(path)
  }

  /// Copy a version's bytes back over the canonical path (rollback).
  pub async fn restore_version(&self, version_path: &Path, document_path: &Path) -> std::io::Result<()> {
    if let Some(parent) = document_path.parent() {
      fs::create_dir_all(parent).await?;
    }
    fs::copy(version_path, document_path).await?;
    Ok(())
  }

  /// Remove a document's bytes and all its version snapshots.
  pub async fn delete_document_files(&self, tenant: TenantId, id: DocumentId, file_name: &str) {
    let document_path = self.document_path(tenant, id, file_name);
    let _ = fs::remove_file(&document_path).await;
    let version_dir = self.tenant_dir(tenant).join("versions").join(id.to_string());
    let _ = fs::remove_dir_all(&version_dir).await;
  }
}

/// md5 hex digest of file bytes (document content hash).
pub fn content_hash(bytes: &[u8]) -> String {
  format!("{:x}", md5::compute(bytes))
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  #[test]
  fn test_canonical_file_name() {
    assert_eq!(canonical_file_name("report.pdf"), "report.pdf");
    assert_eq!(canonical_file_name("dir\\sub\\report.pdf"), "report.pdf");
    assert_eq!(canonical_file_name("dir/sub/report.pdf"), "report.pdf");
    assert_eq!(canonical_file_name("../../etc/passwd"), "passwd");
    assert_eq!(canonical_file_name(""), "unnamed");
  }

  #[tokio::test]
  async fn test_write_snapshot_restore() {
    let temp = TempDir::new().unwrap();
    let storage = DocumentStorage::new(temp.path());
    let tenant = TenantId(1);
    let id = DocumentId::new();

    let path = storage.write_document(tenant, id, "a.txt", b"version one").await.unwrap();
    let snapshot = storage.snapshot_version(tenant, id, 1, "a.txt", &path).await.unwrap();

    storage.write_document(tenant, id, "a.txt", b"version two").await.unwrap();
    assert_eq!(storage.read_document(&path).await.unwrap(), b"version two");

    storage.restore_version(&snapshot, &path).await.unwrap();
    assert_eq!(storage.read_document(&path).await.unwrap(), b"version one");
  }

  #[test]
  fn test_content_hash() {
    assert_eq!(content_hash(b"hello"), "5d41402abc4b2a76b9719d911017c592");
  }
}
