//! Counter and lock storage with two backends of identical semantics: a
//! shared Redis store (so multiple workers see the same counters) and a
//! process-local fallback used when the shared store is unreachable.
//!
//! Degradation is logged once and never surfaces as an error to callers;
//! rate-limit checks must stay infallible at the API boundary.

use std::{
  sync::atomic::{AtomicBool, Ordering},
  time::{Duration, Instant},
};

use dashmap::DashMap;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
#[error("counter store error: {0}")]
pub struct StoreError(pub String);

impl From<redis::RedisError> for StoreError {
  fn from(e: redis::RedisError) -> Self {
    Self(e.to_string())
  }
}

// ============================================================================
// Local backend
// ============================================================================

/// Process-local counters and locks with the same windowed semantics as the
/// shared store.
#[derive(Debug, Default)]
pub struct LocalStore {
  counters: DashMap<String, WindowCounter>,
  locks: DashMap<String, LockEntry>,
}

#[derive(Debug)]
struct WindowCounter {
  window_start: Instant,
  window: Duration,
  count: u64,
}

#[derive(Debug)]
struct LockEntry {
  owner: String,
  expires: Instant,
}

impl LocalStore {
  pub fn incr_window(&self, key: &str, amount: u64, window_secs: u64) -> u64 {
    let window = Duration::from_secs(window_secs);
    let mut entry = self.counters.entry(key.to_string()).or_insert_with(|| WindowCounter {
      window_start: Instant::now(),
      window,
      count: 0,
    });

    if entry.window_start.elapsed() >= entry.window {
      entry.window_start = Instant::now();
      entry.count = 0;
    }
    entry.count += amount;
    entry.count
  }

  pub fn get_window(&self, key: &str) -> u64 {
    match self.counters.get(key) {
      Some(entry) if entry.window_start.elapsed() < entry.window => entry.count,
      _ => 0,
    }
  }

  pub fn acquire_lock(&self, name: &str, owner: &str, ttl_secs: u64) -> bool {
    let now = Instant::now();
    let mut acquired = false;
    self
      .locks
      .entry(name.to_string())
      .and_modify(|entry| {
        if entry.expires <= now {
          entry.owner = owner.to_string();
          entry.expires = now + Duration::from_secs(ttl_secs);
          acquired = true;
        } else {
          acquired = entry.owner == owner;
        }
      })
      .or_insert_with(|| {
        acquired = true;
        LockEntry {
          owner: owner.to_string(),
          expires: now + Duration::from_secs(ttl_secs),
        }
      });
    acquired
  }

  pub fn refresh_lock(&self, name: &str, owner: &str, ttl_secs: u64) -> bool {
    match self.locks.get_mut(name) {
      Some(mut entry) if entry.owner == owner && entry.expires > Instant::now() => {
        entry.expires = Instant::now() + Duration::from_secs(ttl_secs);
        true
      }
      _ => false,
    }
  }

  pub fn release_lock(&self, name: &str, owner: &str) -> bool {
    if let Some(entry) = self.locks.get(name) {
      if entry.owner != owner {
        return false;
      }
    } else {
      return false;
    }
    self.locks.remove(name).is_some()
  }
}

// ============================================================================
// Shared (Redis) backend
// ============================================================================

pub struct RedisStore {
  manager: redis::aio::ConnectionManager,
}

impl RedisStore {
  pub async fn connect(url: &str) -> Result<Self, StoreError> {
    let client = redis::Client::open(url).map_err(StoreError::from)?;
    let manager = redis::aio::ConnectionManager::new(client).await.map_err(StoreError::from)?;
    info!(url, "Connected to shared counter store");
    Ok(Self { manager })
  }

  pub async fn incr_window(&self, key: &str, amount: u64, window_secs: u64) -> Result<u64, StoreError> {
    let mut conn = self.manager.clone();
    let count: u64 = conn.incr(key, amount).await?;
    if count == amount {
      // First hit in this window owns the TTL.
      let _: i64 = redis::cmd("EXPIRE")
        .arg(key)
        .arg(window_secs)
        .query_async(&mut conn)
        .await?;
    }
    Ok(count)
  }

  pub async fn get_window(&self, key: &str) -> Result<u64, StoreError> {
    let mut conn = self.manager.clone();
    let value: Option<u64> = conn.get(key).await?;
    Ok(value.unwrap_or(0))
  }

  pub async fn acquire_lock(&self, name: &str, owner: &str, ttl_secs: u64) -> Result<bool, StoreError> {
    let mut conn = self.manager.clone();
    // Atomic set-if-absent with TTL.
    let result: Option<String> = redis::cmd("SET")
      .arg(name)
      .arg(owner)
      .arg("NX")
      .arg("EX")
      .arg(ttl_secs)
      .query_async(&mut conn)
      .await?;
    Ok(result.is_some())
  }

  pub async fn refresh_lock(&self, name: &str, owner: &str, ttl_secs: u64) -> Result<bool, StoreError> {
    let mut conn = self.manager.clone();
    let current: Option<String> = conn.get(name).await?;
    if current.as_deref() == Some(owner) {
      let _: i64 = redis::cmd("EXPIRE").arg(name).arg(ttl_secs).query_async(&mut conn).await?;
      Ok(true)
    } else {
      Ok(false)
    }
  }

  pub async fn release_lock(&self, name: &str, owner: &str) -> Result<bool, StoreError> {
    let mut conn = self.manager.clone();
    let current: Option<String> = conn.get(name).await?;
    if current.as_deref() == Some(owner) {
      let deleted: u64 = conn.del(name).await?;
      Ok(deleted > 0)
    } else {
      Ok(false)
    }
  }
}

// ============================================================================
// Combined store
// ============================================================================

/// Counter/lock store preferring the shared backend, degrading to local
/// state when it is unreachable.
pub struct CounterStore {
  shared: Option<RedisStore>,
  local: LocalStore,
  degraded: AtomicBool,
}

impl CounterStore {
  /// Connect to the shared store when a URL is configured; otherwise run
  /// process-local from the start.
  pub async fn connect(redis_url: Option<&str>) -> Self {
    let shared = match redis_url {
      Some(url) => match RedisStore::connect(url).await {
        Ok(store) => Some(store),
        Err(e) => {
          warn!(error = %e, "Shared counter store unavailable, using process-local counters");
          None
        }
      },
      None => {
        debug!("No shared store configured, using process-local counters");
        None
      }
    };

    Self {
      shared,
      local: LocalStore::default(),
      degraded: AtomicBool::new(false),
    }
  }

  pub fn local_only() -> Self {
    Self {
      shared: None,
      local: LocalStore::default(),
      degraded: AtomicBool::new(false),
    }
  }

  fn note_degraded(&self, error: &StoreError) {
    if !self.degraded.swap(true, Ordering::Relaxed) {
      warn!(error = %error.0, "Shared counter store failed, degrading to process-local counters");
    }
  }

  pub async fn incr_window(&self, key: &str, amount: u64, window_secs: u64) -> u64 {
    if let Some(shared) = &self.shared {
      match shared.incr_window(key, amount, window_secs).await {
        Ok(count) => return count,
        Err(e) => self.note_degraded(&e),
      }
    }
    self.local.incr_window(key, amount, window_secs)
  }

  pub async fn get_window(&self, key: &str) -> u64 {
    if let Some(shared) = &self.shared {
      match shared.get_window(key).await {
        Ok(count) => return count,
        Err(e) => self.note_degraded(&e),
      }
    }
    self.local.get_window(key)
  }

  pub async fn acquire_lock(&self, name: &str, owner: &str, ttl_secs: u64) -> bool {
    if let Some(shared) = &self.shared {
      match shared.acquire_lock(name, owner, ttl_secs).await {
        Ok(acquired) => return acquired,
        Err(e) => self.note_degraded(&e),
      }
    }
    self.local.acquire_lock(name, owner, ttl_secs)
  }

  pub async fn refresh_lock(&self, name: &str, owner: &str, ttl_secs: u64) -> bool {
    if let Some(shared) = &self.shared {
      match shared.refresh_lock(name, owner, ttl_secs).await {
        Ok(refreshed) => return refreshed,
        Err(e) => self.note_degraded(&e),
      }
    }
    self.local.refresh_lock(name, owner, ttl_secs)
  }

  pub async fn release_lock(&self, name: &str, owner: &str) -> bool {
    if let Some(shared) = &self.shared {
      match shared.release_lock(name, owner).await {
        Ok(released) => return released,
        Err(e) => self.note_degraded(&e),
      }
    }
    self.local.release_lock(name, owner)
  }
}
