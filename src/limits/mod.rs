//! Per-tenant rate limits and distributed coordination primitives.
//!
//! Counters live in the shared store so multiple workers enforce one budget;
//! when the store is down the checks keep admitting requests against
//! process-local counters. No limiter call ever returns a store error.

mod lock;
mod store;

use std::sync::Arc;

pub use lock::{AUTO_IMPORT_LOCK, AUTO_IMPORT_LOCK_TTL_SECS, DistributedLock};
pub use store::{CounterStore, LocalStore, RedisStore, StoreError};
use tracing::debug;

use crate::{config::TenantLimitsConfig, domain::tenant::TenantId};

/// A tenant exceeded one of its knowledge-base budgets.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{scope} rate limit exceeded: {current}/{limit} per {window_secs}s")]
pub struct LimitExceeded {
  pub scope: &'static str,
  pub limit: u64,
  pub current: u64,
  pub window_secs: u64,
  /// Budget left before this check (used for user-facing messages)
  pub remaining: u64,
}

/// Enforces the per-tenant retrieval / embedding / upload budgets.
pub struct TenantLimiter {
  store: Arc<CounterStore>,
  config: TenantLimitsConfig,
}

impl TenantLimiter {
  pub fn new(store: Arc<CounterStore>, config: TenantLimitsConfig) -> Self {
    Self { store, config }
  }

  pub fn store(&self) -> Arc<CounterStore> {
    Arc::clone(&self.store)
  }

  fn key(scope: &str, tenant: TenantId) -> String {
    format!("kb:{scope}:{tenant}")
  }

  /// Count one retrieval request (60 s window).
  pub async fn check_retrieval(&self, tenant: TenantId) -> Result<(), LimitExceeded> {
    self
      .check("retrieval", tenant, 1, self.config.kb_retrieval_rpm as u64, 60)
      .await
  }

  /// Count one upload (1 h window).
  pub async fn check_upload(&self, tenant: TenantId) -> Result<(), LimitExceeded> {
    self
      .check("upload", tenant, 1, self.config.kb_upload_per_hour as u64, 3600)
      .await
  }

  /// Embedding API calls the tenant can still make in this window.
  pub async fn embedding_remaining(&self, tenant: TenantId) -> u64 {
    let current = self.store.get_window(&Self::key("embedding", tenant)).await;
    (self.config.kb_embedding_rpm as u64).saturating_sub(current)
  }

  /// Reserve `calls` embedding API calls, failing fast when the window lacks
  /// headroom for the whole batch; partial embedding is never started.
  pub async fn try_consume_embedding(&self, tenant: TenantId, calls: u64) -> Result<(), LimitExceeded> {
    let limit = self.config.kb_embedding_rpm as u64;
    let current = self.store.get_window(&Self::key("embedding", tenant)).await;
    let remaining = limit.saturating_sub(current);
    if remaining < calls {
      return Err(LimitExceeded {
        scope: "embedding",
        limit,
        current,
        window_secs: 60,
        remaining,
      });
    }

    let count = self.store.incr_window(&Self::key("embedding", tenant), calls, 60).await;
    debug!(tenant = %tenant, calls, count, limit, "Embedding budget consumed");
    Ok(())
  }

  async fn check(
    &self,
    scope: &'static str,
    tenant: TenantId,
    amount: u64,
    limit: u64,
    window_secs: u64,
  ) -> Result<(), LimitExceeded> {
    let key = Self::key(scope, tenant);
    let count = self.store.incr_window(&key, amount, window_secs).await;
    if count > limit {
      return Err(LimitExceeded {
        scope,
        limit,
        current: count,
        window_secs,
        remaining: 0,
      });
    }
    Ok(())
  }
}
