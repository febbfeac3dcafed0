//! Distributed lock used to elect the single auto-import leader.
//!
//! Acquisition is an atomic set-if-absent with TTL; only the owner may
//! refresh or release. A crashed holder's lock becomes acquirable once the
//! TTL lapses.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use super::store::CounterStore;

/// Name of the auto-import leader lock.
pub const AUTO_IMPORT_LOCK: &str = "library:auto_import:lock";

/// Lock TTL: long enough for one import cycle, auto-released on crash.
pub const AUTO_IMPORT_LOCK_TTL_SECS: u64 = 300;

pub struct DistributedLock {
  store: Arc<CounterStore>,
  name: String,
  owner: String,
  ttl_secs: u64,
}

impl DistributedLock {
  /// Create a lock handle with a process-unique owner id (`<pid>:<uuid8>`).
  pub fn new(store: Arc<CounterStore>, name: impl Into<String>, ttl_secs: u64) -> Self {
    let owner = format!("{}:{}", std::process::id(), &Uuid::new_v4().simple().to_string()[..8]);
    Self {
      store,
      name: name.into(),
      owner,
      ttl_secs,
    }
  }

  pub fn owner(&self) -> &str {
    &self.owner
  }

  /// Try to become the lock holder. Returns false when another worker holds
  /// the (unexpired) lock.
  pub async fn acquire(&self) -> bool {
    let acquired = self.store.acquire_lock(&self.name, &self.owner, self.ttl_secs).await;
    if acquired {
      info!(lock = %self.name, owner = %self.owner, "Lock acquired");
    } else {
      debug!(lock = %self.name, "Lock held by another worker");
    }
    acquired
  }

  /// Refresh the TTL; fails when this handle no longer owns the lock.
  pub async fn refresh(&self) -> bool {
    self.store.refresh_lock(&self.name, &self.owner, self.ttl_secs).await
  }

  /// Release the lock if still owned.
  pub async fn release(&self) -> bool {
    self.store.release_lock(&self.name, &self.owner).await
  }
}
